mod cipher;
mod error;

pub use cipher::SettingsCipher;
pub use error::CryptoError;
