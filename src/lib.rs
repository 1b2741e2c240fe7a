pub mod config;
pub mod crc;
pub mod device;
pub mod error;
pub mod parser;
pub mod protocol;
pub mod realtime;
pub mod records;
pub mod schema;
pub mod transport;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn build_version() -> String {
    if built_info::GIT_COMMIT_HASH_SHORT.is_some() {
        format!(
            "{}-{}{}",
            built_info::PKG_VERSION,
            built_info::GIT_COMMIT_HASH_SHORT.unwrap(),
            if built_info::GIT_DIRTY.unwrap_or(false) {
                "-dirty"
            } else {
                ""
            }
        )
    } else {
        built_info::PKG_VERSION.to_string()
    }
}
