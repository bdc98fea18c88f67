pub mod connect;
pub mod delay;
pub mod disconnect;
pub mod host_status;
pub mod info;
pub mod reset;
pub mod write_abort;
