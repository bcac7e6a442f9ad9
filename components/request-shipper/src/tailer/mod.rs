pub mod follower;
pub mod tailer;
