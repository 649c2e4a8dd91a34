//! Job-specific training strategies

pub mod autoencoder;
pub mod diffusion;

pub use autoencoder::AutoencoderTrainer;
pub use diffusion::DiffusionTrainer;
