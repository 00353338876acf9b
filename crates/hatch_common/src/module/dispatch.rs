//! Auto-load dispatcher
//!
//! Maps a capability name to the one module declaring it, loads that
//! module on first use and forwards the call. Mappings are cached in the
//! runtime.

use tracing::debug;

use crate::error::{HatchError, Result};
use crate::module::descriptor::CallOutput;
use crate::module::loader::ModuleLoader;
use crate::runtime::Runtime;

pub struct Dispatcher;

impl Dispatcher {
    /// Name of the single available module declaring `capability`
    pub fn resolve(rt: &mut Runtime, capability: &str) -> Result<String> {
        if let Some(module) = rt.capabilities.get(capability) {
            return Ok(module.clone());
        }

        let mut providers = rt.registry.providers_of(capability);
        match providers.len() {
            0 => Err(HatchError::UnknownCapability(capability.to_string())),
            1 => {
                let module = providers.remove(0);
                debug!("Capability {} -> {}", capability, module);
                rt.capabilities
                    .insert(capability.to_string(), module.clone());
                Ok(module)
            }
            _ => Err(HatchError::AmbiguousCapability {
                capability: capability.to_string(),
                modules: providers,
            }),
        }
    }

    /// Resolve, auto-load if needed, then call
    pub fn invoke(rt: &mut Runtime, capability: &str, args: &[String]) -> Result<CallOutput> {
        let module = Self::resolve(rt, capability)?;

        if !rt.registry.is_loaded(&module) {
            debug!("Auto-loading {} for {}", module, capability);
            ModuleLoader::load(rt, &[module.as_str()])?;
        }

        let hooks = rt
            .registry
            .get(&module)
            .ok_or_else(|| HatchError::UnknownModule(module.clone()))?
            .hooks();

        hooks
            .call(capability, args, rt)
            .map_err(|e| HatchError::CapabilityFailed {
                capability: capability.to_string(),
                module,
                reason: format!("{e:#}"),
            })
    }
}
