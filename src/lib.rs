pub mod config;
pub mod data;
pub mod diffusion;
pub mod error;
pub mod models;
pub mod trainers;

// Re-export common types
pub use config::{load_config, parse_device, Config};
pub use error::TexDiffError;
pub use trainers::{DiffusionModule, ModuleComponents};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger at Info level unless `RUST_LOG` says otherwise.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
