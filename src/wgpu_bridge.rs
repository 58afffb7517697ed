//! Texture-import rendering back-end.
//!
//! Imports finished buffers into a wgpu device for compositing. GPU buffers
//! come in zero-copy: the dmabuf fd is imported through raw Vulkan handles
//! (via `as_hal`) as an external-memory image and wrapped back into a wgpu
//! texture with `texture_from_raw`. Shared-memory buffers are uploaded with
//! `Queue::write_texture`.
//!
//! [`SlotTexture`] keeps one imported texture per swapchain slot and only
//! re-imports when the slot's buffer identity actually changes.

use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};

use ash::vk;
use tracing::{debug, info, trace};

use crate::buffer::{Buffer, DmaBuffer, ShmBuffer};
use crate::error::{BridgeError, ImportError};
use crate::formats;

/// A wgpu texture wrapping an imported buffer.
#[derive(Clone)]
pub struct WgpuTexture {
    inner: Arc<WgpuTextureInner>,
}

struct WgpuTextureInner {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    /// Whether this texture was imported from external memory (dmabuf)
    external: bool,
}

impl WgpuTexture {
    fn new(
        texture: wgpu::Texture,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        external: bool,
    ) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("swapchain-texture-view"),
            format: Some(format),
            dimension: Some(wgpu::TextureViewDimension::D2),
            aspect: wgpu::TextureAspect::All,
            base_mip_level: 0,
            mip_level_count: None,
            base_array_layer: 0,
            array_layer_count: None,
            usage: None,
        });
        WgpuTexture {
            inner: Arc::new(WgpuTextureInner {
                texture,
                view,
                format,
                width,
                height,
                external,
            }),
        }
    }

    /// The texture view for sampling.
    pub fn view(&self) -> &wgpu::TextureView {
        &self.inner.view
    }

    /// The underlying wgpu texture.
    pub fn texture(&self) -> &wgpu::Texture {
        &self.inner.texture
    }

    /// Texture format.
    pub fn format(&self) -> wgpu::TextureFormat {
        self.inner.format
    }

    /// Texture width in pixels.
    pub fn width(&self) -> u32 {
        self.inner.width
    }

    /// Texture height in pixels.
    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Whether the texture was imported from external memory.
    ///
    /// External textures are y-inverted relative to locally rendered
    /// content and need a flipped sample space at draw time.
    pub fn is_external(&self) -> bool {
        self.inner.external
    }

    /// Whether two handles wrap the same underlying texture.
    pub fn same_texture(&self, other: &WgpuTexture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WgpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuTexture")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .field("external", &self.inner.external)
            .finish()
    }
}

/// The wgpu rendering back-end.
pub struct WgpuBridge {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuBridge {
    /// Create a bridge on a fresh Vulkan-backed wgpu device.
    pub fn new() -> Result<Self, BridgeError> {
        info!("creating wgpu back-end");

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| BridgeError::AdapterCreation(format!("{e:?}")))?;

        info!("using adapter: {}", adapter.get_info().name);

        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
                label: Some("lamco-swapchain"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
            }))
            .map_err(|e| BridgeError::DeviceCreation(format!("{e:?}")))?;

        Ok(WgpuBridge {
            instance,
            adapter,
            device,
            queue,
        })
    }

    /// The wgpu device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// The wgpu queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The wgpu adapter.
    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    /// Import a buffer, routing by variant.
    ///
    /// # Safety
    ///
    /// For GPU buffers the exported fds must stay valid until the returned
    /// texture is dropped, and the buffer must not be written while the GPU
    /// reads from it.
    pub unsafe fn import(&self, buffer: &Buffer) -> Result<WgpuTexture, ImportError> {
        match buffer {
            Buffer::Dma(dma) => self.import_dmabuf(dma),
            Buffer::Shm(shm) => self.import_shm(shm),
        }
    }

    /// Import a GPU buffer's first plane as an external-memory texture.
    ///
    /// # Safety
    ///
    /// Same as [`import`](WgpuBridge::import).
    pub unsafe fn import_dmabuf(&self, buffer: &DmaBuffer) -> Result<WgpuTexture, ImportError> {
        let width = buffer.width;
        let height = buffer.height;
        if width == 0 || height == 0 {
            return Err(ImportError::InvalidDimensions { width, height });
        }

        let wgpu_format = formats::fourcc_to_wgpu(buffer.fourcc)
            .ok_or(ImportError::UnsupportedFormat(buffer.fourcc))?;
        let vk_format = formats::fourcc_to_vk(buffer.fourcc)
            .ok_or(ImportError::UnsupportedFormat(buffer.fourcc))?;

        // This path wraps the image as a plain wgpu texture, which only
        // works for single-plane layouts; multi-plane modifiers go through
        // the explicit-image back-end.
        let plane = match buffer.planes() {
            [plane] => plane,
            planes => {
                return Err(ImportError::InvalidPlanes(format!(
                    "wgpu import supports 1 plane, buffer has {}",
                    planes.len()
                )))
            }
        };

        let modifier = u64::from(buffer.modifier);
        let modifier = if formats::is_implicit(buffer.modifier) {
            u64::from(drm_fourcc::DrmModifier::Linear)
        } else {
            modifier
        };

        debug!(
            width,
            height,
            fourcc = ?buffer.fourcc,
            modifier = format_args!("{modifier:#x}"),
            stride = plane.stride,
            "importing dmabuf into wgpu"
        );

        let hal_device_guard = self
            .device
            .as_hal::<wgpu_hal::api::Vulkan>()
            .ok_or(ImportError::BridgeUnavailable)?;
        let hal_device: &wgpu_hal::vulkan::Device = hal_device_guard.deref();

        let raw_device = hal_device.raw_device();
        let physical_device = hal_device.raw_physical_device();

        // Dup the fd because vkImportMemoryFdKHR takes ownership; the
        // original stays owned by the buffer.
        // SAFETY: the plane fd is valid for the buffer's lifetime.
        let import_fd = unsafe {
            let duped = libc::dup(plane.fd.as_raw_fd());
            if duped < 0 {
                return Err(ImportError::FdImport("failed to dup dmabuf fd".into()));
            }
            duped
        };

        let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let plane_layouts = [vk::SubresourceLayout {
            offset: plane.offset as u64,
            size: 0, // computed by the driver for modifier images
            row_pitch: plane.stride as u64,
            array_pitch: 0,
            depth_pitch: 0,
        }];
        let mut modifier_explicit_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(modifier)
            .plane_layouts(&plane_layouts);

        let image_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_memory_info)
            .push_next(&mut modifier_explicit_info);

        // SAFETY: raw_device is valid and image_create_info is fully initialized.
        let vk_image = match unsafe { raw_device.create_image(&image_create_info, None) } {
            Ok(image) => image,
            Err(e) => {
                // SAFETY: import_fd is owned here and not yet consumed.
                unsafe { libc::close(import_fd) };
                return Err(ImportError::ImageCreation(format!(
                    "vkCreateImage failed: {e:?}"
                )));
            }
        };

        // SAFETY: raw_device and vk_image are valid.
        let mem_requirements = unsafe { raw_device.get_image_memory_requirements(vk_image) };
        let mem_properties = match self.physical_device_memory_properties(physical_device) {
            Ok(props) => props,
            Err(e) => {
                // SAFETY: both handles are valid and unused elsewhere.
                unsafe {
                    raw_device.destroy_image(vk_image, None);
                    libc::close(import_fd);
                }
                return Err(e);
            }
        };

        let memory_type_index = match find_memory_type_index(
            &mem_properties,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Some(index) => index,
            None => {
                // SAFETY: both handles are valid and unused elsewhere.
                unsafe {
                    raw_device.destroy_image(vk_image, None);
                    libc::close(import_fd);
                }
                return Err(ImportError::MemoryImport(
                    "no suitable memory type found".into(),
                ));
            }
        };

        let mut import_memory_fd_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(import_fd);
        let mut dedicated_alloc_info = vk::MemoryDedicatedAllocateInfo::default().image(vk_image);
        let memory_allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index as u32)
            .push_next(&mut import_memory_fd_info)
            .push_next(&mut dedicated_alloc_info);

        // SAFETY: on success Vulkan owns import_fd; on failure it is closed here.
        let vk_memory = match unsafe { raw_device.allocate_memory(&memory_allocate_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: both handles are valid and unused elsewhere.
                unsafe {
                    raw_device.destroy_image(vk_image, None);
                    libc::close(import_fd);
                }
                return Err(ImportError::MemoryImport(format!(
                    "vkAllocateMemory failed: {e:?}"
                )));
            }
        };

        // SAFETY: raw_device, vk_image and vk_memory are valid.
        if let Err(e) = unsafe { raw_device.bind_image_memory(vk_image, vk_memory, 0) } {
            // SAFETY: both objects were created above and are not in use.
            unsafe {
                raw_device.free_memory(vk_memory, None);
                raw_device.destroy_image(vk_image, None);
            }
            return Err(ImportError::MemoryImport(format!(
                "vkBindImageMemory failed: {e:?}"
            )));
        }

        let hal_desc = wgpu_hal::TextureDescriptor {
            label: Some("dmabuf-import"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format,
            usage: wgpu_types::TextureUses::RESOURCE | wgpu_types::TextureUses::COPY_SRC,
            memory_flags: wgpu_hal::MemoryFlags::empty(),
            view_formats: vec![],
        };

        // SAFETY: vk_image/vk_memory were created above and hal_desc
        // describes the image accurately.
        let hal_texture = unsafe {
            hal_device.texture_from_raw(
                vk_image,
                &hal_desc,
                None,
                wgpu_hal::vulkan::TextureMemory::Dedicated(vk_memory),
            )
        };

        let wgpu_desc = wgpu::TextureDescriptor {
            label: Some("dmabuf-import"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        };

        // SAFETY: hal_texture is a valid HAL texture matching wgpu_desc.
        let texture = unsafe {
            self.device
                .create_texture_from_hal::<wgpu_hal::api::Vulkan>(hal_texture, &wgpu_desc)
        };

        Ok(WgpuTexture::new(texture, wgpu_format, width, height, true))
    }

    /// Upload a shared-memory buffer into a fresh texture.
    pub fn import_shm(&self, buffer: &ShmBuffer) -> Result<WgpuTexture, ImportError> {
        let fourcc = buffer.fourcc();
        let wgpu_format =
            formats::fourcc_to_wgpu(fourcc).ok_or(ImportError::UnsupportedFormat(fourcc))?;
        let (width, height) = (buffer.width(), buffer.height());

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("shm-import"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let wrapped = WgpuTexture::new(texture, wgpu_format, width, height, false);
        self.upload_shm(&wrapped, buffer)?;
        Ok(wrapped)
    }

    /// Re-upload a shared-memory buffer's current contents into `texture`.
    pub fn upload_shm(&self, texture: &WgpuTexture, buffer: &ShmBuffer) -> Result<(), ImportError> {
        let (width, height) = (buffer.width(), buffer.height());
        if texture.width() != width || texture.height() != height {
            return Err(ImportError::ShmAccess(format!(
                "texture {}x{} does not match buffer {width}x{height}",
                texture.width(),
                texture.height()
            )));
        }

        let expected = buffer.len();
        buffer.read(|data| {
            if data.len() < expected {
                return Err(ImportError::ShmAccess(format!(
                    "mapping is {} bytes, expected {expected}",
                    data.len()
                )));
            }
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: texture.texture(),
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &data[..expected],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(buffer.stride()),
                    rows_per_image: None,
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            Ok(())
        })
    }

    unsafe fn physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::PhysicalDeviceMemoryProperties, ImportError> {
        let hal_adapter_guard = self
            .adapter
            .as_hal::<wgpu_hal::api::Vulkan>()
            .ok_or(ImportError::BridgeUnavailable)?;
        let hal_adapter: &wgpu_hal::vulkan::Adapter = hal_adapter_guard.deref();
        let instance = hal_adapter.shared_instance().raw_instance();
        // SAFETY: caller guarantees physical_device belongs to this instance.
        Ok(unsafe { instance.get_physical_device_memory_properties(physical_device) })
    }
}

fn find_memory_type_index(
    mem_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required_flags: vk::MemoryPropertyFlags,
) -> Option<usize> {
    (0..mem_properties.memory_type_count as usize).find(|&i| {
        let type_bit = 1u32 << i;
        (type_bits & type_bit) != 0
            && (mem_properties.memory_types[i].property_flags & required_flags) == required_flags
    })
}

/// Imported-texture cache for one swapchain slot.
///
/// `sync` is the render thread's entry point: it re-imports only when the
/// slot's buffer identity changed since the last call. Shared-memory
/// buffers are additionally re-uploaded every sync, since their contents
/// change in place.
#[derive(Default)]
pub struct SlotTexture {
    buffer: Weak<Buffer>,
    texture: Option<WgpuTexture>,
}

impl SlotTexture {
    /// An empty slot with nothing imported.
    pub fn new() -> Self {
        SlotTexture::default()
    }

    /// The cached texture, if any.
    pub fn texture(&self) -> Option<&WgpuTexture> {
        self.texture.as_ref()
    }

    /// Make the cached texture reflect `buffer`, importing if needed.
    ///
    /// # Safety
    ///
    /// Same requirements as [`WgpuBridge::import`].
    pub unsafe fn sync(
        &mut self,
        buffer: &Arc<Buffer>,
        bridge: &WgpuBridge,
    ) -> Result<&WgpuTexture, ImportError> {
        let unchanged = self
            .buffer
            .upgrade()
            .map(|held| Arc::ptr_eq(&held, buffer))
            .unwrap_or(false);

        if !unchanged || self.texture.is_none() {
            trace!("slot buffer changed, importing");
            let texture = unsafe { bridge.import(buffer) }?;
            self.buffer = Arc::downgrade(buffer);
            self.texture = Some(texture);
        } else if let (Some(texture), Buffer::Shm(shm)) = (&self.texture, buffer.as_ref()) {
            bridge.upload_shm(texture, shm)?;
        }

        match &self.texture {
            Some(texture) => Ok(texture),
            // Unreachable: the branch above always fills the slot.
            None => Err(ImportError::BridgeUnavailable),
        }
    }

    /// Drop the cached texture, forcing a re-import on the next sync.
    pub fn invalidate(&mut self) {
        self.buffer = Weak::new();
        self.texture = None;
    }
}

impl std::fmt::Debug for SlotTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTexture")
            .field("imported", &self.texture.is_some())
            .finish()
    }
}
