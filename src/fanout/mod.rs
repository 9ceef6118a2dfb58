pub mod book_server;
pub mod tick_server;

pub use book_server::BookFanoutServer;
pub use tick_server::TickFanoutServer;
