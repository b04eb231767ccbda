pub mod catalog;
pub mod data_dir;
pub mod languages;
pub mod settings;
