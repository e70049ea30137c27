//! 常用功能一站式导入.

pub use crate::{Idx2d, Idx3d};

pub use crate::consts::IMG_SIZE;
pub use crate::data::{normalize, KidneyVolume, VolumeError, VolumeMeta};
pub use crate::infer::{segment, segment_with, Prediction, SegmentError};
pub use crate::Modality;
pub use crate::net::{DualDecoderNet, NetError, SliceModel};
pub use crate::post_proc::largest_component;
pub use crate::probe::{ConfigError, RuntimeSupport};
pub use crate::scene::{KidneySegmentation, SceneRegistrar, SegmentPart};
