pub mod influx;
pub mod sink;
