pub mod credentials;

pub use credentials::{
    CloudConnection, CredentialCache, CredentialProvider, Credentials, HttpCredentialProvider,
};
