// SPDX-License-Identifier: CEPL-1.0
use crate::error::{Error, Result};
use ash::vk;
use tracing::error;

/// First memory type allowed by `filter` whose properties include `flags`.
#[inline]
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    filter: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    for i in 0..count {
        let ok = (filter & (1 << i)) != 0
            && props.memory_types[i as usize].property_flags.contains(flags);
        if ok {
            return Ok(i);
        }
    }
    error!("no memory type for filter {filter:#b} with {flags:?}");
    Err(Error::NoMemoryType { filter, flags })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties::default();
        p.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            p.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        p
    }

    const DEVICE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_type_that_is_allowed_and_has_flags() {
        let p = props(&[DEVICE, HOST, HOST | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(find_memory_type(&p, 0b111, HOST).unwrap(), 1);
        assert_eq!(find_memory_type(&p, 0b100, HOST).unwrap(), 2);
        assert_eq!(find_memory_type(&p, 0b111, DEVICE).unwrap(), 0);
    }

    #[test]
    fn flags_must_be_a_superset() {
        let p = props(&[vk::MemoryPropertyFlags::HOST_VISIBLE, HOST]);
        assert_eq!(find_memory_type(&p, 0b11, HOST).unwrap(), 1);
    }

    #[test]
    fn no_match_is_an_error() {
        let p = props(&[DEVICE, HOST]);
        let err = find_memory_type(&p, 0b01, HOST).unwrap_err();
        assert!(matches!(err, Error::NoMemoryType { filter: 0b01, .. }));
        // bits beyond the advertised count are ignored
        assert!(find_memory_type(&p, 0b100, vk::MemoryPropertyFlags::empty()).is_err());
    }
}
