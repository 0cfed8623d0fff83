pub mod chunking;
pub mod file_scanner;
pub mod file_text_extraction;
pub mod resource_gate;
