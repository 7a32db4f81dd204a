pub mod compression;
pub mod exit;
pub mod fs;
pub mod str;
