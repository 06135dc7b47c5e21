mod doorkeeper;
mod frequency;

pub use doorkeeper::Doorkeeper;
pub use frequency::FrequencySketch;
