pub mod commands;
pub mod connection;
pub mod modbus;
pub mod output;
pub mod registers;
pub mod rover;
