pub mod info;
pub mod remove_background;
pub mod warm;
