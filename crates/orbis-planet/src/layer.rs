//! Imagery layers and their draw order.

use std::sync::Arc;

use orbis_quadtree::{ImageryLayer, LayerId, TileProvider};

/// One imagery layer draped over the globe.
#[derive(Clone)]
pub struct Layer {
    id: LayerId,
    name: String,
    visibility: bool,
    opacity: f32,
    z_index: i32,
    is_base_layer: bool,
    tint: [f32; 3],
    generation: u64,
    planet_attached: bool,
    provider: Arc<dyn TileProvider>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("opacity", &self.opacity)
            .field("z_index", &self.z_index)
            .field("is_base_layer", &self.is_base_layer)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Layer {
    /// A visible, opaque, untinted overlay at z-index 0.
    pub fn new(id: LayerId, name: impl Into<String>, provider: Arc<dyn TileProvider>) -> Self {
        Self {
            id,
            name: name.into(),
            visibility: true,
            opacity: 1.0,
            z_index: 0,
            is_base_layer: false,
            tint: [1.0, 1.0, 1.0],
            generation: 0,
            planet_attached: false,
            provider,
        }
    }

    pub fn with_visibility(mut self, visible: bool) -> Self {
        self.visibility = visible;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn with_z_index(mut self, z_index: i32) -> Self {
        self.z_index = z_index;
        self
    }

    pub fn with_base(mut self, base: bool) -> Self {
        self.is_base_layer = base;
        self
    }

    pub fn with_tint(mut self, tint: [f32; 3]) -> Self {
        self.tint = tint;
        self
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> bool {
        self.visibility
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn z_index(&self) -> i32 {
        self.z_index
    }

    pub fn is_base_layer(&self) -> bool {
        self.is_base_layer
    }

    pub fn tint(&self) -> [f32; 3] {
        self.tint
    }

    pub fn set_tint(&mut self, tint: [f32; 3]) {
        self.tint = tint;
    }

    /// Load generation; tiles requested under an older one are discarded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a registry has adopted this layer.
    pub fn is_attached(&self) -> bool {
        self.planet_attached
    }

    pub fn provider(&self) -> &Arc<dyn TileProvider> {
        &self.provider
    }

    /// Invalidate every load in flight for this layer.
    pub fn abort_loading(&mut self) {
        self.generation += 1;
    }

    /// Draw color for the overlay shader: tint in RGB, opacity in alpha.
    pub fn tint_with_opacity(&self) -> [f32; 4] {
        [self.tint[0], self.tint[1], self.tint[2], self.opacity]
    }

    pub fn imagery_layer(&self) -> ImageryLayer {
        ImageryLayer {
            id: self.id,
            generation: self.generation,
            provider: Arc::clone(&self.provider),
        }
    }
}

/// Every layer of a planet, the active base layer and the current draw
/// order.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: Vec<Layer>,
    base_layer: Option<LayerId>,
    visible: Vec<LayerId>,
    /// Layers whose loads were aborted since the last drain.
    aborted: Vec<LayerId>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `layer`. Returns `false` if its id is already registered.
    pub fn add_layer(&mut self, mut layer: Layer) -> bool {
        if self.layers.iter().any(|l| l.id == layer.id) {
            log::warn!("Layer {} is already registered, ignoring", layer.id);
            return false;
        }
        layer.planet_attached = true;
        let id = layer.id;
        let becomes_base = layer.is_base_layer && layer.visibility;
        log::debug!("Added layer {id} '{}'", layer.name);
        self.layers.push(layer);
        if becomes_base {
            self.set_base_layer(id);
        } else {
            self.update_visible_layers();
        }
        true
    }

    /// Adopt each layer in order; returns how many were new.
    pub fn add_layers(&mut self, layers: impl IntoIterator<Item = Layer>) -> usize {
        layers
            .into_iter()
            .map(|layer| self.add_layer(layer))
            .filter(|added| *added)
            .count()
    }

    /// Make `id` the one visible base layer. Loads of the previous base are
    /// aborted. Calling this for the current base layer does nothing.
    pub fn set_base_layer(&mut self, id: LayerId) {
        if self.base_layer == Some(id) {
            return;
        }
        let Some(position) = self.position(id) else {
            log::warn!("Cannot make unknown layer {id} the base layer");
            return;
        };
        for layer in self.layers.iter_mut().filter(|l| l.is_base_layer) {
            layer.visibility = false;
        }
        let layer = &mut self.layers[position];
        layer.is_base_layer = true;
        layer.visibility = true;

        if let Some(previous) = self.base_layer.replace(id)
            && let Some(old) = self.layers.iter_mut().find(|l| l.id == previous)
        {
            old.abort_loading();
            self.aborted.push(previous);
        }
        log::info!("Base layer is now {id}");
        self.update_visible_layers();
    }

    /// Recompute draw order: visible layers only, the base layer ranked
    /// -1 and the rest by ascending z-index. Ties keep insertion order.
    pub fn update_visible_layers(&mut self) {
        let base = self.base_layer;
        let mut visible: Vec<&Layer> = self.layers.iter().filter(|l| l.visibility).collect();
        visible.sort_by_key(|l| {
            if Some(l.id) == base {
                -1
            } else {
                i64::from(l.z_index)
            }
        });
        self.visible = visible.into_iter().map(|l| l.id).collect();
    }

    /// Show or hide a layer. Showing a base layer makes it the active base.
    pub fn set_visibility(&mut self, id: LayerId, visible: bool) {
        let Some(position) = self.position(id) else {
            log::warn!("Cannot change visibility of unknown layer {id}");
            return;
        };
        if visible && self.layers[position].is_base_layer {
            self.set_base_layer(id);
            return;
        }
        self.layers[position].visibility = visible;
        self.update_visible_layers();
    }

    pub fn set_z_index(&mut self, id: LayerId, z_index: i32) {
        match self.layer_mut(id) {
            Some(layer) => layer.z_index = z_index,
            None => {
                log::warn!("Cannot reorder unknown layer {id}");
                return;
            }
        }
        self.update_visible_layers();
    }

    /// Detach a layer. Its loads are aborted.
    pub fn remove_layer(&mut self, id: LayerId) -> Option<Layer> {
        let position = self.position(id)?;
        let mut layer = self.layers.remove(position);
        if self.base_layer == Some(id) {
            self.base_layer = None;
        }
        layer.planet_attached = false;
        layer.abort_loading();
        self.aborted.push(id);
        self.update_visible_layers();
        log::debug!("Removed layer {id}");
        Some(layer)
    }

    /// Abort a layer's loads without changing anything else.
    pub fn abort_loading(&mut self, id: LayerId) {
        if let Some(layer) = self.layer_mut(id) {
            layer.abort_loading();
            self.aborted.push(id);
        }
    }

    /// Layers aborted since the last call, for cancelling their requests.
    pub fn take_aborted(&mut self) -> Vec<LayerId> {
        std::mem::take(&mut self.aborted)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Visibility and z-index changes made through this reference take
    /// effect after [`update_visible_layers`](Self::update_visible_layers).
    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    /// First layer with this name.
    pub fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn base_layer(&self) -> Option<&Layer> {
        self.base_layer.and_then(|id| self.layer(id))
    }

    /// Visible layers in draw order.
    pub fn visible_layers(&self) -> Vec<&Layer> {
        self.visible.iter().filter_map(|id| self.layer(*id)).collect()
    }

    pub fn visible_ids(&self) -> &[LayerId] {
        &self.visible
    }

    /// Visible layers as the quadtree requests them, in draw order.
    pub fn visible_imagery(&self) -> Vec<ImageryLayer> {
        self.visible_layers()
            .into_iter()
            .map(Layer::imagery_layer)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn position(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbis_quadtree::providers::ManualProvider;

    fn provider() -> Arc<dyn TileProvider> {
        Arc::new(ManualProvider::new())
    }

    fn layer(id: u32) -> Layer {
        Layer::new(LayerId(id), format!("layer-{id}"), provider())
    }

    #[test]
    fn test_visible_order_puts_base_first() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([
            layer(1).with_z_index(5),
            layer(2).with_base(true).with_z_index(0),
            layer(3).with_z_index(2),
        ]);
        assert_eq!(registry.visible_ids(), &[LayerId(2), LayerId(3), LayerId(1)]);
        assert_eq!(registry.base_layer().map(Layer::id), Some(LayerId(2)));
    }

    #[test]
    fn test_equal_z_keeps_insertion_order() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([layer(4), layer(2), layer(9)]);
        assert_eq!(registry.visible_ids(), &[LayerId(4), LayerId(2), LayerId(9)]);
    }

    #[test]
    fn test_hidden_layers_not_drawn() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([layer(1), layer(2).with_visibility(false)]);
        assert_eq!(registry.visible_ids(), &[LayerId(1)]);

        registry.set_visibility(LayerId(2), true);
        registry.set_visibility(LayerId(1), false);
        assert_eq!(registry.visible_ids(), &[LayerId(2)]);
    }

    #[test]
    fn test_set_base_layer_is_idempotent() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([layer(1).with_base(true), layer(2).with_base(true)]);
        // The second base layer took over and aborted the first.
        assert_eq!(registry.take_aborted(), vec![LayerId(1)]);
        assert_eq!(registry.layer(LayerId(1)).unwrap().generation(), 1);

        registry.set_base_layer(LayerId(2));
        registry.set_base_layer(LayerId(2));
        assert!(registry.take_aborted().is_empty());
        assert_eq!(registry.layer(LayerId(2)).unwrap().generation(), 0);
        assert_eq!(registry.visible_ids(), &[LayerId(2)]);
    }

    #[test]
    fn test_switching_base_hides_previous() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([
            layer(1).with_base(true),
            layer(2).with_base(true).with_visibility(false),
            layer(3).with_z_index(1),
        ]);
        assert_eq!(registry.visible_ids(), &[LayerId(1), LayerId(3)]);

        registry.set_base_layer(LayerId(2));
        assert!(!registry.layer(LayerId(1)).unwrap().visibility());
        assert_eq!(registry.visible_ids(), &[LayerId(2), LayerId(3)]);
        assert_eq!(registry.take_aborted(), vec![LayerId(1)]);
    }

    #[test]
    fn test_showing_base_layer_activates_it() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([
            layer(1).with_base(true),
            layer(2).with_base(true).with_visibility(false),
        ]);
        registry.set_visibility(LayerId(2), true);
        assert_eq!(registry.base_layer().map(Layer::id), Some(LayerId(2)));
        assert_eq!(registry.visible_ids(), &[LayerId(2)]);
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let mut registry = LayerRegistry::new();
        assert!(registry.add_layer(layer(1)));
        assert!(!registry.add_layer(layer(1).with_z_index(9)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.layer(LayerId(1)).unwrap().z_index(), 0);
        assert!(registry.layer(LayerId(1)).unwrap().is_attached());
    }

    #[test]
    fn test_unknown_ids_are_noops() {
        let mut registry = LayerRegistry::new();
        registry.add_layer(layer(1));
        registry.set_base_layer(LayerId(7));
        registry.set_visibility(LayerId(7), false);
        registry.set_z_index(LayerId(7), 3);
        assert!(registry.base_layer().is_none());
        assert_eq!(registry.visible_ids(), &[LayerId(1)]);
        assert!(registry.remove_layer(LayerId(7)).is_none());
    }

    #[test]
    fn test_layer_by_name_finds_first_entry() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([
            Layer::new(LayerId(1), "osm", provider()),
            Layer::new(LayerId(2), "sat", provider()),
        ]);
        assert_eq!(registry.layer_by_name("osm").map(Layer::id), Some(LayerId(1)));
        assert_eq!(registry.layer_by_name("sat").map(Layer::id), Some(LayerId(2)));
        assert!(registry.layer_by_name("topo").is_none());
    }

    #[test]
    fn test_remove_base_layer_clears_base() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([layer(1).with_base(true), layer(2)]);
        let removed = registry.remove_layer(LayerId(1)).unwrap();
        assert!(!removed.is_attached());
        assert!(registry.base_layer().is_none());
        assert_eq!(registry.visible_ids(), &[LayerId(2)]);
        assert_eq!(registry.take_aborted(), vec![LayerId(1)]);
    }

    #[test]
    fn test_z_index_change_reorders() {
        let mut registry = LayerRegistry::new();
        registry.add_layers([layer(1).with_z_index(1), layer(2).with_z_index(2)]);
        registry.set_z_index(LayerId(1), 3);
        assert_eq!(registry.visible_ids(), &[LayerId(2), LayerId(1)]);
    }

    #[test]
    fn test_imagery_layers_carry_generation() {
        let mut registry = LayerRegistry::new();
        registry.add_layer(layer(1));
        registry.abort_loading(LayerId(1));
        let imagery = registry.visible_imagery();
        assert_eq!(imagery.len(), 1);
        assert_eq!(imagery[0].id, LayerId(1));
        assert_eq!(imagery[0].generation, 1);
    }

    #[test]
    fn test_opacity_clamped() {
        let l = layer(1).with_opacity(1.5).with_tint([0.5, 0.25, 1.0]);
        assert_eq!(l.tint_with_opacity(), [0.5, 0.25, 1.0, 1.0]);
    }
}
