//! Baked appearance textures
//!
//! Each body region owns an ordered stack of layers. Any change to a texture
//! slot, texture payload or global tint a layer depends on marks the region
//! dirty; [`CompositeAppearance::refresh_dirty`] re-composites dirty regions
//! whose inputs are all loaded. Bakes are tagged with a per-region generation
//! so a result computed before a newer change is dropped on commit.

use glam::{Vec3, Vec4};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::texture::TextureData;
use crate::error::{AvatarError, AvatarResult};

/// Largest edge length a baked region may have
pub const MAX_BAKE_RESOLUTION: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BakeRegion {
    Head,
    UpperBody,
    LowerBody,
    Eyes,
    Skirt,
    Hair,
}

impl BakeRegion {
    pub const ALL: [BakeRegion; 6] = [
        BakeRegion::Head,
        BakeRegion::UpperBody,
        BakeRegion::LowerBody,
        BakeRegion::Eyes,
        BakeRegion::Skirt,
        BakeRegion::Hair,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        BakeRegion::ALL.into_iter().find(|r| r.as_str() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BakeRegion::Head => "head",
            BakeRegion::UpperBody => "upper_body",
            BakeRegion::LowerBody => "lower_body",
            BakeRegion::Eyes => "eyes",
            BakeRegion::Skirt => "skirt",
            BakeRegion::Hair => "hair",
        }
    }
}

impl std::fmt::Display for BakeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TintSource {
    None,
    GlobalColor(String),
    Fixed(Vec4),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerDefinition {
    pub name: String,
    /// Texture slot supplying the layer's color; `None` for a flat tint layer
    pub local_texture: Option<String>,
    pub tint: TintSource,
    /// Texture slot whose last channel masks the layer
    pub alpha_texture: Option<String>,
    pub invert_alpha: bool,
}

impl LayerDefinition {
    fn uses_slot(&self, slot: &str) -> bool {
        self.local_texture.as_deref() == Some(slot) || self.alpha_texture.as_deref() == Some(slot)
    }

    fn uses_global_color(&self, name: &str) -> bool {
        matches!(&self.tint, TintSource::GlobalColor(n) if n == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BakedTexture {
    pub id: Uuid,
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8
    pub pixels: Arc<[u8]>,
}

/// Handle for one bake of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BakeTicket {
    pub region: BakeRegion,
    generation: u64,
}

#[derive(Debug, Default)]
struct RegionState {
    layers: Vec<LayerDefinition>,
    dirty: bool,
    generation: u64,
    baked: Option<BakedTexture>,
}

#[derive(Debug)]
pub struct CompositeAppearance {
    resolution: u32,
    fallback: Uuid,
    regions: BTreeMap<BakeRegion, RegionState>,
    slots: HashMap<String, Uuid>,
    textures: HashMap<Uuid, Arc<TextureData>>,
    global_colors: HashMap<String, Vec4>,
}

impl CompositeAppearance {
    pub fn new(resolution: u32, fallback: Uuid) -> Self {
        let clamped = resolution.clamp(1, MAX_BAKE_RESOLUTION);
        if clamped != resolution {
            warn!("Bake resolution {} out of range, using {}", resolution, clamped);
        }
        Self {
            resolution: clamped,
            fallback,
            regions: BTreeMap::new(),
            slots: HashMap::new(),
            textures: HashMap::new(),
            global_colors: HashMap::new(),
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn set_layers(&mut self, region: BakeRegion, layers: Vec<LayerDefinition>) {
        self.regions.entry(region).or_default().layers = layers;
        self.mark_dirty(region);
    }

    pub fn regions(&self) -> impl Iterator<Item = BakeRegion> + '_ {
        self.regions.keys().copied()
    }

    pub fn mark_dirty(&mut self, region: BakeRegion) {
        if let Some(state) = self.regions.get_mut(&region) {
            state.dirty = true;
            state.generation += 1;
        }
    }

    fn mark_where(&mut self, pred: impl Fn(&LayerDefinition) -> bool) {
        let affected: Vec<BakeRegion> = self
            .regions
            .iter()
            .filter(|(_, state)| state.layers.iter().any(&pred))
            .map(|(region, _)| *region)
            .collect();
        for region in affected {
            self.mark_dirty(region);
        }
    }

    /// Assign a texture id to a wearable slot. Returns whether anything changed.
    pub fn set_local_texture(&mut self, slot: &str, id: Option<Uuid>) -> bool {
        let changed = match id {
            Some(id) => self.slots.insert(slot.to_string(), id) != Some(id),
            None => self.slots.remove(slot).is_some(),
        };
        if changed {
            debug!("Slot '{}' now {:?}", slot, id);
            self.mark_where(|layer| layer.uses_slot(slot));
            self.prune_textures();
        }
        changed
    }

    /// Whether any slot currently points at `id`
    pub fn references(&self, id: Uuid) -> bool {
        self.slots.values().any(|&slot_id| slot_id == id)
    }

    /// Number of texture payloads currently held
    pub fn cached_textures(&self) -> usize {
        self.textures.len()
    }

    fn prune_textures(&mut self) {
        let before = self.textures.len();
        let slots = &self.slots;
        self.textures.retain(|id, _| slots.values().any(|slot_id| slot_id == id));
        if self.textures.len() != before {
            debug!("Released {} unreferenced textures", before - self.textures.len());
        }
    }

    pub fn local_texture(&self, slot: &str) -> Option<Uuid> {
        self.slots.get(slot).copied()
    }

    /// Update a global tint; regions are only invalidated when it changes
    pub fn set_global_color(&mut self, name: &str, color: Vec4) -> bool {
        if self.global_colors.get(name) == Some(&color) {
            return false;
        }
        self.global_colors.insert(name.to_string(), color);
        self.mark_where(|layer| layer.uses_global_color(name));
        true
    }

    pub fn global_color(&self, name: &str) -> Option<Vec4> {
        self.global_colors.get(name).copied()
    }

    /// Texture payload delivered by the asset collaborator. Payloads no slot
    /// refers to are not kept.
    pub fn on_texture_data_available(&mut self, region: BakeRegion, id: Uuid, data: Arc<TextureData>) {
        if !self.references(id) {
            debug!("Ignoring texture {} for {}: no slot uses it", id, region);
            return;
        }
        debug!("Texture {} ready for {} ({}x{})", id, region, data.width(), data.height());
        self.textures.insert(id, data);
        let slots: Vec<String> = self
            .slots
            .iter()
            .filter(|&(_, &slot_id)| slot_id == id)
            .map(|(slot, _)| slot.clone())
            .collect();
        self.mark_where(|layer| slots.iter().any(|s| layer.uses_slot(s)));
        self.mark_dirty(region);
    }

    /// Start a bake. Any ticket issued earlier for the region becomes stale.
    pub fn request_bake(&mut self, region: BakeRegion) -> BakeTicket {
        let state = self.regions.entry(region).or_default();
        state.generation += 1;
        BakeTicket { region, generation: state.generation }
    }

    fn resolve(&self, slot: Option<&str>) -> Result<Option<&TextureData>, ()> {
        match slot {
            None => Ok(None),
            Some(slot) => match self.slots.get(slot) {
                None => Err(()),
                Some(id) => Ok(self.textures.get(id).map(|t| t.as_ref())),
            },
        }
    }

    fn missing_texture(&self, region: BakeRegion) -> Option<Uuid> {
        let state = self.regions.get(&region)?;
        state
            .layers
            .iter()
            .flat_map(|layer| [layer.local_texture.as_deref(), layer.alpha_texture.as_deref()])
            .flatten()
            .filter_map(|slot| self.slots.get(slot))
            .find(|id| !self.textures.contains_key(*id))
            .copied()
    }

    fn tint(&self, source: &TintSource) -> Vec4 {
        match source {
            TintSource::None => Vec4::ONE,
            TintSource::Fixed(color) => *color,
            TintSource::GlobalColor(name) => self.global_colors.get(name).copied().unwrap_or(Vec4::ONE),
        }
    }

    /// Composite the region's layers into an RGBA8 buffer. Fails with
    /// `ResourceUnavailable` while any assigned texture is still loading.
    pub fn composite(&self, region: BakeRegion) -> AvatarResult<Vec<u8>> {
        if let Some(id) = self.missing_texture(region) {
            return Err(AvatarError::ResourceUnavailable {
                what: format!("texture {} for {}", id, region),
            });
        }
        let res = self.resolution;
        let edge = res as usize;
        let mut accum = vec![Vec4::ZERO; edge * edge];
        let layers = self.regions.get(&region).map(|s| s.layers.as_slice()).unwrap_or_default();

        for layer in layers {
            // unassigned slot: the wearable isn't worn
            let Ok(color_tex) = self.resolve(layer.local_texture.as_deref()) else {
                continue;
            };
            let alpha_tex = self.resolve(layer.alpha_texture.as_deref()).ok().flatten();
            if layer.local_texture.is_some() && color_tex.is_none() {
                continue;
            }
            let tint = self.tint(&layer.tint);

            for y in 0..res {
                for x in 0..res {
                    let texel = match color_tex {
                        Some(tex) => {
                            let (sx, sy) = tex.nearest_for(x, y, res, res);
                            Vec4::from_array(tex.rgba(sx, sy).map(|c| c as f32 / 255.0))
                        }
                        None => Vec4::ONE,
                    };
                    let mut src = texel * tint;
                    if let Some(tex) = alpha_tex {
                        let (sx, sy) = tex.nearest_for(x, y, res, res);
                        let a = tex.alpha(sx, sy) as f32 / 255.0;
                        src.w *= if layer.invert_alpha { 1.0 - a } else { a };
                    }
                    let a = src.w.clamp(0.0, 1.0);
                    let premul = (src.truncate().clamp(Vec3::ZERO, Vec3::ONE) * a).extend(a);
                    let dst = &mut accum[y as usize * edge + x as usize];
                    *dst = premul + *dst * (1.0 - a);
                }
            }
        }

        let mut pixels = Vec::with_capacity(accum.len() * 4);
        for p in accum {
            let rgb = if p.w > 0.0 { p.truncate() / p.w } else { Vec3::ZERO };
            for c in rgb.extend(p.w).to_array() {
                pixels.push((c.clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
        Ok(pixels)
    }

    /// Install a bake result. Returns false (and drops the pixels) when the
    /// ticket was superseded.
    pub fn commit_bake(&mut self, ticket: BakeTicket, pixels: Vec<u8>) -> bool {
        let res = self.resolution;
        let expected = res as usize * res as usize * 4;
        let Some(state) = self.regions.get_mut(&ticket.region) else {
            return false;
        };
        if state.generation != ticket.generation {
            debug!(
                "Discarding stale bake for {} (generation {}, current {})",
                ticket.region, ticket.generation, state.generation
            );
            return false;
        }
        if pixels.len() != expected {
            warn!("Bake for {} has {} bytes, expected {}", ticket.region, pixels.len(), expected);
            return false;
        }
        let id = Uuid::new_v4();
        info!("Baked {} as {}", ticket.region, id);
        state.baked = Some(BakedTexture { id, width: res, height: res, pixels: pixels.into() });
        state.dirty = false;
        self.prune_textures();
        true
    }

    /// Re-bake one region if dirty. Returns whether a new bake was committed.
    pub fn refresh(&mut self, region: BakeRegion) -> AvatarResult<bool> {
        if !self.is_dirty(region) {
            return Ok(false);
        }
        let ticket = self.request_bake(region);
        let pixels = self.composite(region)?;
        Ok(self.commit_bake(ticket, pixels))
    }

    /// Re-bake every dirty region that has all of its textures
    pub fn refresh_dirty(&mut self) -> Vec<BakeRegion> {
        let dirty: Vec<BakeRegion> = self.regions.iter().filter(|(_, s)| s.dirty).map(|(r, _)| *r).collect();
        let mut baked = Vec::new();
        for region in dirty {
            match self.refresh(region) {
                Ok(true) => baked.push(region),
                Ok(false) => {}
                Err(e) => debug!("Deferring bake of {}: {}", region, e),
            }
        }
        baked
    }

    pub fn is_dirty(&self, region: BakeRegion) -> bool {
        self.regions.get(&region).is_some_and(|s| s.dirty)
    }

    pub fn baked(&self, region: BakeRegion) -> Option<&BakedTexture> {
        self.regions.get(&region).and_then(|s| s.baked.as_ref())
    }

    /// Texture the renderer should bind for a region
    pub fn texture_for(&self, region: BakeRegion) -> Uuid {
        self.baked(region).map_or(self.fallback, |b| b.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: Uuid = Uuid::from_u128(0xc228d1cf_4b5d_4ba8_84f4_899a0796aa97);

    fn solid(rgba: [u8; 4]) -> Arc<TextureData> {
        Arc::new(TextureData::new(2, 2, 4, rgba.repeat(4)).unwrap())
    }

    fn layer(name: &str, slot: Option<&str>, tint: TintSource) -> LayerDefinition {
        LayerDefinition {
            name: name.to_string(),
            local_texture: slot.map(str::to_string),
            tint,
            alpha_texture: None,
            invert_alpha: false,
        }
    }

    fn head() -> CompositeAppearance {
        let mut c = CompositeAppearance::new(4, FALLBACK);
        c.set_layers(
            BakeRegion::Head,
            vec![
                layer("head skin", None, TintSource::GlobalColor("skin_color".into())),
                layer("head tattoo", Some("head_tattoo"), TintSource::None),
            ],
        );
        c
    }

    fn pixel(buf: &[u8], i: usize) -> [u8; 4] {
        [buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]
    }

    #[test]
    fn test_region_names() {
        for region in BakeRegion::ALL {
            assert_eq!(BakeRegion::parse(region.as_str()), Some(region));
        }
        assert_eq!(BakeRegion::parse("tail"), None);
    }

    #[test]
    fn test_fallback_until_first_bake() {
        let mut c = head();
        assert_eq!(c.texture_for(BakeRegion::Head), FALLBACK);
        assert!(c.is_dirty(BakeRegion::Head));
        assert_eq!(c.refresh_dirty(), vec![BakeRegion::Head]);
        assert_ne!(c.texture_for(BakeRegion::Head), FALLBACK);
        assert!(!c.is_dirty(BakeRegion::Head));
        assert_eq!(c.texture_for(BakeRegion::Hair), FALLBACK);
    }

    #[test]
    fn test_unassigned_slot_is_skipped_and_tint_applies() {
        let mut c = head();
        c.set_global_color("skin_color", Vec4::new(1.0, 0.5, 0.0, 1.0));
        let pixels = c.composite(BakeRegion::Head).unwrap();
        assert_eq!(pixel(&pixels, 0), [255, 128, 0, 255]);
    }

    #[test]
    fn test_layers_composite_over() {
        let mut c = head();
        c.set_global_color("skin_color", Vec4::new(0.0, 0.0, 1.0, 1.0));
        let tattoo = Uuid::new_v4();
        c.set_local_texture("head_tattoo", Some(tattoo));

        // assigned but not delivered yet
        assert!(matches!(c.composite(BakeRegion::Head), Err(AvatarError::ResourceUnavailable { .. })));
        assert!(c.refresh_dirty().is_empty());
        assert!(c.is_dirty(BakeRegion::Head));

        c.on_texture_data_available(BakeRegion::Head, tattoo, solid([255, 0, 0, 128]));
        let pixels = c.composite(BakeRegion::Head).unwrap();
        let [r, g, b, a] = pixel(&pixels, 5);
        assert_eq!(a, 255);
        assert_eq!(g, 0);
        assert!((r as i32 - 128).abs() <= 1 && (b as i32 - 127).abs() <= 1, "{:?}", (r, b));
    }

    #[test]
    fn test_alpha_texture_masks_layer() {
        let mut c = CompositeAppearance::new(2, FALLBACK);
        let mut masked = layer("eyes", None, TintSource::Fixed(Vec4::new(0.0, 1.0, 0.0, 1.0)));
        masked.alpha_texture = Some("eyes_alpha".into());
        masked.invert_alpha = true;
        c.set_layers(BakeRegion::Eyes, vec![masked]);
        let alpha_id = Uuid::new_v4();
        c.set_local_texture("eyes_alpha", Some(alpha_id));
        // single channel: left column opaque, right column clear
        c.on_texture_data_available(BakeRegion::Eyes, alpha_id, Arc::new(TextureData::new(2, 1, 1, vec![255, 0]).unwrap()));
        let pixels = c.composite(BakeRegion::Eyes).unwrap();
        assert_eq!(pixel(&pixels, 0)[3], 0);
        assert_eq!(pixel(&pixels, 1), [0, 255, 0, 255]);
    }

    #[test]
    fn test_recomposite_is_idempotent() {
        let mut c = head();
        let tattoo = Uuid::new_v4();
        c.set_local_texture("head_tattoo", Some(tattoo));
        c.on_texture_data_available(BakeRegion::Head, tattoo, solid([10, 20, 30, 200]));
        assert_eq!(c.composite(BakeRegion::Head).unwrap(), c.composite(BakeRegion::Head).unwrap());
    }

    #[test]
    fn test_invalidation_rules() {
        let mut c = head();
        c.refresh_dirty();
        assert!(!c.set_global_color("skin_color", Vec4::ONE) || c.is_dirty(BakeRegion::Head));
        c.refresh_dirty();
        assert!(!c.set_global_color("skin_color", Vec4::ONE));
        assert!(!c.is_dirty(BakeRegion::Head));

        // a tint no layer uses doesn't invalidate
        c.set_global_color("hair_color", Vec4::ZERO);
        assert!(!c.is_dirty(BakeRegion::Head));

        c.set_local_texture("head_tattoo", Some(Uuid::new_v4()));
        assert!(c.is_dirty(BakeRegion::Head));
    }

    #[test]
    fn test_oversized_resolution_is_clamped() {
        let mut c = CompositeAppearance::new(70_000, FALLBACK);
        assert_eq!(c.resolution(), MAX_BAKE_RESOLUTION);
        c.set_layers(BakeRegion::Eyes, vec![layer("eyes", None, TintSource::Fixed(Vec4::ONE))]);
        assert_eq!(c.refresh_dirty(), vec![BakeRegion::Eyes]);
        let baked = c.baked(BakeRegion::Eyes).unwrap();
        assert_eq!(baked.pixels.len(), (MAX_BAKE_RESOLUTION as usize).pow(2) * 4);

        assert_eq!(CompositeAppearance::new(0, FALLBACK).resolution(), 1);
    }

    #[test]
    fn test_reassigned_slots_release_textures() {
        let mut c = head();
        for _ in 0..100 {
            let id = Uuid::new_v4();
            c.set_local_texture("head_tattoo", Some(id));
            c.on_texture_data_available(BakeRegion::Head, id, solid([1, 2, 3, 255]));
            c.refresh_dirty();
        }
        assert_eq!(c.cached_textures(), 1);

        // nothing refers to a stray payload
        c.on_texture_data_available(BakeRegion::Head, Uuid::new_v4(), solid([0, 0, 0, 255]));
        assert_eq!(c.cached_textures(), 1);

        c.set_local_texture("head_tattoo", None);
        assert_eq!(c.cached_textures(), 0);
    }

    #[test]
    fn test_stale_ticket_discarded() {
        let mut c = head();
        let first = c.request_bake(BakeRegion::Head);
        let pixels = c.composite(BakeRegion::Head).unwrap();
        let second = c.request_bake(BakeRegion::Head);
        assert!(!c.commit_bake(first, pixels.clone()));
        assert_eq!(c.texture_for(BakeRegion::Head), FALLBACK);
        assert!(c.commit_bake(second, pixels.clone()));
        let baked = c.texture_for(BakeRegion::Head);

        // a change after the request also invalidates the ticket
        let third = c.request_bake(BakeRegion::Head);
        c.set_global_color("skin_color", Vec4::ZERO);
        assert!(!c.commit_bake(third, pixels));
        assert_eq!(c.texture_for(BakeRegion::Head), baked);
    }
}
