// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op} failed: {result:?}")]
    Vk { op: &'static str, result: vk::Result },

    #[error("no memory type matches filter {filter:#b} with flags {flags:?}")]
    NoMemoryType {
        filter: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("no physical device satisfies the selection predicate")]
    NoPhysicalDevice,

    #[error("no {0} queue family")]
    NoQueueFamily(&'static str),

    #[error("validation layer VK_LAYER_KHRONOS_validation is not available")]
    MissingValidationLayer,

    #[error("shader {name} failed to compile:\n{log}")]
    ShaderCompile { name: String, log: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("descriptor write rejected: {0}")]
    Descriptor(String),

    #[error("window handle unavailable: {0}")]
    Window(#[from] raw_window_handle::HandleError),

    /// A proxy was consumed after its creation failed.
    #[error("{0} did not produce a resource")]
    Failed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach the Vulkan entry point name to a raw `VkResult`.
pub(crate) trait VkContext<T> {
    fn vk_op(self, op: &'static str) -> Result<T>;
}

impl<T> VkContext<T> for ash::prelude::VkResult<T> {
    fn vk_op(self, op: &'static str) -> Result<T> {
        self.map_err(|result| {
            error!("{op} failed: {result:?}");
            Error::Vk { op, result }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_op_names_the_entry_point() {
        let failed: ash::prelude::VkResult<u32> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = failed.vk_op("vkCreateSwapchainKHR").unwrap_err();
        assert!(matches!(
            err,
            Error::Vk {
                op: "vkCreateSwapchainKHR",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
        ));
        assert_eq!(Ok::<u32, vk::Result>(4).vk_op("vkCreateFence").unwrap(), 4);
    }
}
