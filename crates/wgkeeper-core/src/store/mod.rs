mod directory;
mod memory;

pub use directory::StaticDirectory;
pub use memory::MemoryStore;
