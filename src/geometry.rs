use ash::{vk, Device, Instance};

use crate::error::{GeometryError, InitError};

const COMPONENTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    points: Vec<[f32; COMPONENTS]>,
}

impl Geometry {
    pub fn new(flat: &[f32]) -> Result<Self, GeometryError> {
        if flat.is_empty() {
            return Err(GeometryError::Empty);
        }
        if flat.len() % COMPONENTS != 0 {
            return Err(GeometryError::Ragged { len: flat.len() });
        }
        let points = flat
            .chunks_exact(COMPONENTS)
            .map(|p| [p[0], p[1], p[2]])
            .collect();
        Ok(Self { points })
    }

    #[cfg(test)]
    pub fn points(&self) -> &[[f32; COMPONENTS]] {
        &self.points
    }

    pub fn point_count(&self) -> u32 {
        self.points.len() as u32
    }

    pub fn components(&self) -> u32 {
        COMPONENTS as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.points)
    }
}

pub struct GeometryBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    vertex_count: u32,
}

impl GeometryBuffer {
    pub fn upload(
        instance: &Instance,
        pdevice: vk::PhysicalDevice,
        device: &Device,
        geometry: &Geometry,
    ) -> Result<Self, InitError> {
        let bytes = geometry.as_bytes();
        unsafe {
            let info = vk::BufferCreateInfo::default()
                .size(bytes.len() as vk::DeviceSize)
                .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = device
                .create_buffer(&info, None)
                .map_err(InitError::vk("create vertex buffer"))?;
            let requirements = device.get_buffer_memory_requirements(buffer);
            let flags =
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
            let memory_props = instance.get_physical_device_memory_properties(pdevice);
            let Some(type_index) =
                find_memory_type(&memory_props, requirements.memory_type_bits, flags)
            else {
                device.destroy_buffer(buffer, None);
                return Err(InitError::NoMemoryType(flags));
            };
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(type_index);
            let memory = match device.allocate_memory(&alloc_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(InitError::vk("allocate vertex memory")(e));
                }
            };
            let written = device
                .map_memory(memory, 0, requirements.size, vk::MemoryMapFlags::empty())
                .and_then(|ptr| {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
                    device.unmap_memory(memory);
                    device.bind_buffer_memory(buffer, memory, 0)
                });
            if let Err(e) = written {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
                return Err(InitError::vk("upload vertex data")(e));
            }
            log::debug!(
                "uploaded {} points ({} bytes) to vertex buffer",
                geometry.point_count(),
                bytes.len()
            );
            Ok(Self {
                buffer,
                memory,
                vertex_count: geometry.point_count(),
            })
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn bind(&self, device: &Device, cmd: vk::CommandBuffer) {
        unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[self.buffer], &[0]) }
    }

    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    props.memory_types[..props.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, t)| type_bits & (1 << i) != 0 && t.property_flags.contains(flags))
        .map(|(i, _)| i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TRIANGLE, TRIANGLE_BG};

    #[test]
    fn triangles_keep_shape() {
        for flat in [TRIANGLE, TRIANGLE_BG] {
            let geometry = Geometry::new(&flat).unwrap();
            assert_eq!(geometry.point_count(), 3);
            assert_eq!(geometry.components(), 3);
            assert_eq!(geometry.as_bytes().len(), 9 * 4);
            assert_eq!(geometry.points().concat(), flat.to_vec());
        }
    }

    #[test]
    fn rejects_ragged_and_empty() {
        assert_eq!(
            Geometry::new(&[0.0; 8]),
            Err(GeometryError::Ragged { len: 8 })
        );
        assert_eq!(Geometry::new(&[]), Err(GeometryError::Empty));
    }

    #[test]
    fn memory_type_respects_mask_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, flags), Some(1));
        assert_eq!(find_memory_type(&props, 0b101, flags), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, flags), None);
    }
}
