pub mod error;

pub mod storage {
    pub mod archiver;
    pub mod db;
    pub mod manifest;
    pub mod state_manager;
    pub mod store;
    pub mod types;
}

pub mod utils {
    pub mod config;
    pub mod content_hash;
    pub mod embedding;
}
