use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Relay error: {0}")]
    Relay(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_anyhow_context() {
        let err = anyhow::Error::from(Error::Credentials("no identity".to_string()))
            .context("Failed to log in");
        assert_eq!(
            err.downcast_ref::<Error>().map(ToString::to_string).as_deref(),
            Some("Credentials error: no identity")
        );
    }
}
