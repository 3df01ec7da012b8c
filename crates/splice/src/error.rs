#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Relay(#[from] splice_relay::RelayError),

    #[error("{0}")]
    Settings(#[from] splice_settings::SettingsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
