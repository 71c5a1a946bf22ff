pub mod buf_ext;
pub mod rolling_data;
