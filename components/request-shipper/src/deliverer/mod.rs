pub mod deliverer;
pub mod printer;
