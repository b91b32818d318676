pub mod frame;
pub mod inverter;
pub mod registers;
pub mod session;
