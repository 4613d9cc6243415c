use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::avatar::library::AvatarLibrary;
use crate::avatar::morph_data::MorphDeltaSet;
use crate::config::AvatarSettings;
use crate::error::AvatarResult;
use crate::world::avatar::{Avatar, AvatarFrame};
use crate::world::events::AvatarEvent;

/// Owns every live avatar plus the shared library they are built from.
///
/// Collaborators push [`AvatarEvent`]s through a cloned sender from any
/// thread; the owner calls [`AvatarRegistry::update_pass`] once per frame to
/// drain them, run the apply phase and collect render snapshots.
pub struct AvatarRegistry {
    library: AvatarLibrary,
    settings: AvatarSettings,
    avatars: BTreeMap<Uuid, Avatar>,
    event_tx: Sender<AvatarEvent>,
    event_rx: Receiver<AvatarEvent>,
}

impl AvatarRegistry {
    pub fn new(library: AvatarLibrary, settings: AvatarSettings) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            library,
            settings,
            avatars: BTreeMap::new(),
            event_tx,
            event_rx,
        }
    }

    pub fn library(&self) -> &AvatarLibrary {
        &self.library
    }

    pub fn settings(&self) -> &AvatarSettings {
        &self.settings
    }

    pub fn event_sender(&self) -> Sender<AvatarEvent> {
        self.event_tx.clone()
    }

    pub fn spawn_avatar(&mut self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let avatar = Avatar::new(id, name, &self.library, &self.settings);
        self.avatars.insert(id, avatar);
        id
    }

    pub fn remove_avatar(&mut self, id: Uuid) -> Option<Avatar> {
        let removed = self.avatars.remove(&id);
        if removed.is_some() {
            info!("Removed avatar {}", id);
        }
        removed
    }

    pub fn avatar(&self, id: Uuid) -> Option<&Avatar> {
        self.avatars.get(&id)
    }

    pub fn avatar_mut(&mut self, id: Uuid) -> Option<&mut Avatar> {
        self.avatars.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }

    fn dispatch(&mut self, event: AvatarEvent) {
        let Some(avatar) = self.avatars.get_mut(&event.avatar_id()) else {
            debug!("Dropping event for unknown avatar {}", event.avatar_id());
            return;
        };
        match event {
            AvatarEvent::TextureDataAvailable(e) => {
                avatar.on_texture_data_available(e.region, e.texture_id, e.data);
            }
            AvatarEvent::ParamChanged(e) => {
                if let Err(err) = avatar.set_param_weight(e.param_id, e.weight) {
                    warn!("Weight for avatar {} not applied as sent: {}", e.avatar_id, err);
                }
            }
            AvatarEvent::LocalTextureChanged(e) => {
                avatar.set_local_texture(&e.slot, e.texture_id);
            }
            AvatarEvent::SexChanged(e) => avatar.set_sex(e.sex),
        }
    }

    /// Drain pending events, update every avatar and return their frames
    pub fn update_pass(&mut self) -> Vec<AvatarFrame> {
        let mut handled = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        if handled > 0 {
            debug!("Handled {} avatar events", handled);
        }

        self.avatars
            .values_mut()
            .map(|avatar| {
                let stats = avatar.update();
                if stats != Default::default() {
                    debug!(
                        "Avatar {}: {} applied, {} deferred, {} baked",
                        avatar.id(),
                        stats.applied,
                        stats.deferred,
                        stats.baked
                    );
                }
                avatar.snapshot()
            })
            .collect()
    }

    /// Replace a shared morph set and move every avatar onto it. Returns how
    /// many avatars were rebased; one that fails is logged and skipped.
    pub fn rebase_morph(&mut self, data: MorphDeltaSet) -> AvatarResult<usize> {
        let mesh_type = data.mesh_name().to_string();
        let morph = data.name().to_string();
        let shared = self.library.replace_morph(data)?;
        let mut count = 0;
        for (id, avatar) in self.avatars.iter_mut() {
            match avatar.rebase_morph(&mesh_type, &morph, shared.clone()) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => warn!("Avatar {} kept its old '{}' morph: {}", id, morph, e),
            }
        }
        info!("Rebased '{}' on '{}' for {} avatars", morph, mesh_type, count);
        Ok(count)
    }
}
