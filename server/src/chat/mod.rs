//! REST views over the message log that sit next to the relay socket.

pub mod history;
