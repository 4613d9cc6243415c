//! Events sent from external collaborators (asset fetcher, appearance
//! updates) to the avatar registry. They are drained between frames.

use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

use crate::assets::texture::TextureData;
use crate::avatar::{BakeRegion, Sex};

/// Decoded texture ready for an avatar
#[derive(Debug, Clone)]
pub struct TextureDataEvent {
    pub avatar_id: Uuid,
    pub region: BakeRegion,
    pub texture_id: Uuid,
    pub data: Arc<TextureData>,
    pub timestamp: SystemTime,
}

/// Visual parameter weight update
#[derive(Debug, Clone)]
pub struct ParamChangedEvent {
    pub avatar_id: Uuid,
    pub param_id: i32,
    pub weight: f32,
    pub timestamp: SystemTime,
}

/// Wearable texture slot (re)assignment
#[derive(Debug, Clone)]
pub struct LocalTextureEvent {
    pub avatar_id: Uuid,
    pub slot: String,
    pub texture_id: Option<Uuid>,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone)]
pub struct SexChangedEvent {
    pub avatar_id: Uuid,
    pub sex: Sex,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone)]
pub enum AvatarEvent {
    TextureDataAvailable(TextureDataEvent),
    ParamChanged(ParamChangedEvent),
    LocalTextureChanged(LocalTextureEvent),
    SexChanged(SexChangedEvent),
}

impl AvatarEvent {
    pub fn avatar_id(&self) -> Uuid {
        match self {
            AvatarEvent::TextureDataAvailable(e) => e.avatar_id,
            AvatarEvent::ParamChanged(e) => e.avatar_id,
            AvatarEvent::LocalTextureChanged(e) => e.avatar_id,
            AvatarEvent::SexChanged(e) => e.avatar_id,
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        match self {
            AvatarEvent::TextureDataAvailable(e) => e.timestamp,
            AvatarEvent::ParamChanged(e) => e.timestamp,
            AvatarEvent::LocalTextureChanged(e) => e.timestamp,
            AvatarEvent::SexChanged(e) => e.timestamp,
        }
    }

    pub fn texture_data(avatar_id: Uuid, region: BakeRegion, texture_id: Uuid, data: Arc<TextureData>) -> Self {
        AvatarEvent::TextureDataAvailable(TextureDataEvent {
            avatar_id,
            region,
            texture_id,
            data,
            timestamp: SystemTime::now(),
        })
    }

    pub fn param_changed(avatar_id: Uuid, param_id: i32, weight: f32) -> Self {
        AvatarEvent::ParamChanged(ParamChangedEvent {
            avatar_id,
            param_id,
            weight,
            timestamp: SystemTime::now(),
        })
    }

    pub fn local_texture(avatar_id: Uuid, slot: impl Into<String>, texture_id: Option<Uuid>) -> Self {
        AvatarEvent::LocalTextureChanged(LocalTextureEvent {
            avatar_id,
            slot: slot.into(),
            texture_id,
            timestamp: SystemTime::now(),
        })
    }

    pub fn sex_changed(avatar_id: Uuid, sex: Sex) -> Self {
        AvatarEvent::SexChanged(SexChangedEvent {
            avatar_id,
            sex,
            timestamp: SystemTime::now(),
        })
    }
}
