pub mod buffer;
pub mod crc;
pub mod io;
pub mod shutdown;
