//! Byte-range I/O for slide files.

mod file_reader;
mod range_reader;

pub use file_reader::LocalFileReader;
pub(crate) use range_reader::check_range;
pub use range_reader::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le, RangeReader,
};
