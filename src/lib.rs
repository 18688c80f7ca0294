pub mod convolve;
pub mod group;
pub mod image;
pub mod init;
pub mod jacobian;
pub mod model;
pub mod params;
pub mod profile;
pub mod store;
pub mod target;
pub mod window;

pub use group::GroupModel;
pub use image::{Image, JacobianImage, ModelImage};
pub use model::{IntegrateMode, JacobianMode, Model, PsfMode};
pub use profile::ProfileKind;
pub use target::TargetImage;
pub use window::Window;
