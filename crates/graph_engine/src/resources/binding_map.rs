//! Shader binding slots mapped to texture views

use std::collections::HashMap;

use super::TextureId;

/// A view onto a texture, deep-clonable through the trait
pub trait TextureView: Send + Sync {
    /// Identity of the viewed texture
    fn texture_id(&self) -> TextureId;
    /// Duplicate the view
    fn clone_view(&self) -> Box<dyn TextureView>;
}

/// Binding-slot to texture-view mapping.
///
/// General bindings use the same view for every back buffer; back-buffered
/// bindings carry one view per buffer. A slot lives in exactly one of the
/// two stores.
#[derive(Default)]
pub struct TextureBindingMap {
    general_bindings: HashMap<i32, Box<dyn TextureView>>,
    back_buffered_bindings: HashMap<i32, Vec<Box<dyn TextureView>>>,
}

impl TextureBindingMap {
    /// Map of slot to one shared view
    pub fn from_general(general_bindings: HashMap<i32, Box<dyn TextureView>>) -> Self {
        Self {
            general_bindings,
            back_buffered_bindings: HashMap::new(),
        }
    }

    /// Map of slot to one view per back buffer
    pub fn from_back_buffered(
        back_buffered_bindings: HashMap<i32, Vec<Box<dyn TextureView>>>,
    ) -> Self {
        Self {
            general_bindings: HashMap::new(),
            back_buffered_bindings,
        }
    }

    /// Expand to `back_buffer_size` views per slot.
    ///
    /// General bindings repeat their single view; back-buffered bindings are
    /// passed through as-is.
    pub fn collect_texture_views(&self, back_buffer_size: usize) -> HashMap<i32, Vec<&dyn TextureView>> {
        let mut result: HashMap<i32, Vec<&dyn TextureView>> = HashMap::new();
        for (binding, view) in &self.general_bindings {
            result.insert(*binding, vec![view.as_ref(); back_buffer_size]);
        }
        for (binding, views) in &self.back_buffered_bindings {
            debug_assert!(
                !result.contains_key(binding),
                "binding slot occupied by both stores"
            );
            result.insert(*binding, views.iter().map(Box::as_ref).collect());
        }
        result
    }
}

impl Clone for TextureBindingMap {
    /// Deep copy: every view in both stores is duplicated through
    /// [`TextureView::clone_view`]
    fn clone(&self) -> Self {
        let mut clone = Self::default();
        for (binding, view) in &self.general_bindings {
            clone.general_bindings.insert(*binding, view.clone_view());
        }
        for (binding, views) in &self.back_buffered_bindings {
            clone
                .back_buffered_bindings
                .insert(*binding, views.iter().map(|view| view.clone_view()).collect());
        }
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;
    use crate::device::{ImageDescription, LogicalDevice};
    use crate::resources::Texture;
    use ash::vk;
    use std::sync::Arc;

    struct WholeTextureView {
        texture: Arc<Texture>,
    }

    impl TextureView for WholeTextureView {
        fn texture_id(&self) -> TextureId {
            self.texture.id()
        }
        fn clone_view(&self) -> Box<dyn TextureView> {
            Box::new(Self {
                texture: self.texture.clone(),
            })
        }
    }

    fn texture() -> Arc<Texture> {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let description = ImageDescription {
            width: 2,
            height: 2,
            depth: 1,
            format: vk::Format::R8G8B8A8_UNORM,
        };
        Arc::new(Texture::new(device, description, vk::ImageUsageFlags::SAMPLED).unwrap())
    }

    fn binding_ids(map: &TextureBindingMap, back_buffer_size: usize) -> Vec<(i32, Vec<TextureId>)> {
        let mut entries: Vec<(i32, Vec<TextureId>)> = map
            .collect_texture_views(back_buffer_size)
            .into_iter()
            .map(|(binding, views)| {
                (binding, views.iter().map(|view| view.texture_id()).collect())
            })
            .collect();
        entries.sort_by_key(|entry| entry.0);
        entries
    }

    #[test]
    fn clone_of_clone_preserves_keys_and_views() {
        let shared = texture();
        let per_frame = texture();

        let mut general: HashMap<i32, Box<dyn TextureView>> = HashMap::new();
        general.insert(0, Box::new(WholeTextureView { texture: shared }));
        let mut map = TextureBindingMap::from_general(general);
        map.back_buffered_bindings.insert(
            1,
            vec![
                Box::new(WholeTextureView {
                    texture: per_frame.clone(),
                }),
                Box::new(WholeTextureView { texture: per_frame }),
            ],
        );

        let twice = map.clone().clone();
        assert_eq!(binding_ids(&map, 2), binding_ids(&twice, 2));
    }

    #[test]
    fn general_bindings_repeat_per_back_buffer() {
        let shared = texture();
        let id = shared.id();
        let mut general: HashMap<i32, Box<dyn TextureView>> = HashMap::new();
        general.insert(3, Box::new(WholeTextureView { texture: shared }));
        let map = TextureBindingMap::from_general(general);

        let views = map.collect_texture_views(3);
        assert_eq!(views[&3].len(), 3);
        assert!(views[&3].iter().all(|view| view.texture_id() == id));
    }
}
