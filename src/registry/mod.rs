//! Capability registry for Flash and Reset plugins
//!
//! Flashing and resetting a device are pluggable operations. Each plugin
//! registers a named [Capability] with a fixed parameter contract; the
//! registry resolves `(kind, name)` to the executable action and validates
//! the supplied parameters before invoking it. The registry is built once
//! at start-up, is immutable afterwards, and is shared by reference with
//! every component that needs it. Retry policy belongs to callers, never
//! to the registry.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use strum::{Display, EnumIter, VariantNames};

use crate::{error::Error, transport::Transport};

pub mod builtin;

/// The two kinds of device operation a plugin can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum CapabilityKind {
    Flash,
    Reset,
}

/// String parameters passed to a capability invocation.
pub type CapabilityParams = HashMap<String, String>;

type FlashFn = Box<dyn Fn(&CapabilityParams) -> Result<bool, Error> + Send + Sync>;
type ResetFn =
    Box<dyn Fn(&CapabilityParams, Option<&mut dyn Transport>) -> Result<bool, Error> + Send + Sync>;

/// The executable half of a capability.
///
/// Reset actions optionally receive the live transport handle, since some
/// reset methods act through the connection itself while others (power
/// cyclers, probes) act out of band.
pub enum CapabilityAction {
    Flash(FlashFn),
    Reset(ResetFn),
}

/// A named, pluggable Flash or Reset operation.
pub struct Capability {
    name: String,
    required_parameters: BTreeSet<String>,
    supported: fn() -> bool,
    action: CapabilityAction,
}

fn always_supported() -> bool {
    true
}

impl Capability {
    pub fn new(
        name: impl Into<String>,
        required_parameters: impl IntoIterator<Item = &'static str>,
        action: CapabilityAction,
    ) -> Self {
        Self {
            name: name.into(),
            required_parameters: required_parameters
                .into_iter()
                .map(str::to_string)
                .collect(),
            supported: always_supported,
            action,
        }
    }

    /// Restrict this capability to hosts for which `predicate` holds.
    pub fn supported_when(mut self, predicate: fn() -> bool) -> Self {
        self.supported = predicate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CapabilityKind {
        match self.action {
            CapabilityAction::Flash(_) => CapabilityKind::Flash,
            CapabilityAction::Reset(_) => CapabilityKind::Reset,
        }
    }

    /// Whether this capability can run on the current host. Callers must
    /// check this before invoking; the registry does not filter on it.
    pub fn is_supported(&self) -> bool {
        (self.supported)()
    }

    fn check_params(&self, params: &CapabilityParams) -> Result<(), Error> {
        for required in &self.required_parameters {
            if !params.contains_key(required) {
                return Err(Error::MissingParameter {
                    name: self.name.clone(),
                    parameter: required.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Capability table, keyed by kind and name.
#[derive(Default)]
pub struct Registry {
    capabilities: Vec<Capability>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the capabilities dutrun ships.
    pub fn with_builtin_capabilities() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    /// Add a capability. Two capabilities of the same kind may not share a
    /// name; this is a construction-time error, not a runtime one.
    pub fn register(&mut self, capability: Capability) -> Result<(), Error> {
        if self.find(capability.kind(), capability.name()).is_some() {
            return Err(Error::DuplicateCapability {
                kind: capability.kind(),
                name: capability.name().to_string(),
            });
        }

        debug!(
            "Registered {} capability '{}'",
            capability.kind(),
            capability.name()
        );
        self.capabilities.push(capability);
        Ok(())
    }

    fn find(&self, kind: CapabilityKind, name: &str) -> Option<&Capability> {
        self.capabilities
            .iter()
            .find(|c| c.kind() == kind && c.name() == name)
    }

    fn resolve(&self, kind: CapabilityKind, name: &str) -> Result<&Capability, Error> {
        self.find(kind, name).ok_or_else(|| Error::UnknownCapability {
            kind,
            name: name.to_string(),
        })
    }

    /// Whether the named capability exists and can run on this host.
    pub fn is_supported(&self, kind: CapabilityKind, name: &str) -> bool {
        self.find(kind, name).is_some_and(Capability::is_supported)
    }

    /// Whether the named capability declares the given required parameter.
    pub fn requires_parameter(&self, kind: CapabilityKind, name: &str, parameter: &str) -> bool {
        self.find(kind, name)
            .is_some_and(|c| c.required_parameters.contains(parameter))
    }

    /// Invoke the named Flash capability.
    pub fn call_flash(&self, name: &str, params: &CapabilityParams) -> Result<bool, Error> {
        let capability = self.resolve(CapabilityKind::Flash, name)?;
        capability.check_params(params)?;

        match &capability.action {
            CapabilityAction::Flash(execute) => execute(params),
            CapabilityAction::Reset(_) => unreachable!("kind checked by resolve"),
        }
    }

    /// Invoke the named Reset capability, with the live transport handle if
    /// one is available.
    pub fn call_reset(
        &self,
        name: &str,
        params: &CapabilityParams,
        transport: Option<&mut dyn Transport>,
    ) -> Result<bool, Error> {
        let capability = self.resolve(CapabilityKind::Reset, name)?;
        capability.check_params(params)?;

        match &capability.action {
            CapabilityAction::Reset(execute) => execute(params, transport),
            CapabilityAction::Flash(_) => unreachable!("kind checked by resolve"),
        }
    }

    /// Names of every registered capability of the given kind.
    pub fn capabilities_of(&self, kind: CapabilityKind) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|c| c.kind() == kind)
            .map(Capability::name)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop_flash(name: &str, params: &[&'static str]) -> Capability {
        Capability::new(
            name,
            params.iter().copied(),
            CapabilityAction::Flash(Box::new(|_| Ok(true))),
        )
    }

    #[test]
    fn duplicate_names_are_rejected_per_kind() {
        let mut registry = Registry::new();
        registry.register(noop_flash("copy", &[])).unwrap();

        let duplicate = registry.register(noop_flash("copy", &[]));
        assert!(matches!(
            duplicate,
            Err(Error::DuplicateCapability { .. })
        ));

        // The same name under the other kind is fine.
        let reset = Capability::new(
            "copy",
            [],
            CapabilityAction::Reset(Box::new(|_, _| Ok(true))),
        );
        registry.register(reset).unwrap();
    }

    #[test]
    fn missing_parameter_fails_fast() {
        let mut registry = Registry::new();
        registry
            .register(noop_flash("copy", &["image_path", "destination_disk"]))
            .unwrap();

        let mut params = CapabilityParams::new();
        params.insert("image_path".to_string(), "app.bin".to_string());

        let result = registry.call_flash("copy", &params);
        match result {
            Err(Error::MissingParameter { name, parameter }) => {
                assert_eq!(name, "copy");
                assert_eq!(parameter, "destination_disk");
            }
            other => panic!("expected missing-parameter error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_capability_is_an_error() {
        let registry = Registry::new();
        let result = registry.call_flash("jtag", &CapabilityParams::new());
        assert!(matches!(result, Err(Error::UnknownCapability { .. })));
    }

    #[test]
    fn enumerates_names_by_kind() {
        let mut registry = Registry::new();
        registry.register(noop_flash("copy", &[])).unwrap();
        registry.register(noop_flash("probe", &[])).unwrap();

        let mut names = registry.capabilities_of(CapabilityKind::Flash);
        names.sort_unstable();
        assert_eq!(names, vec!["copy", "probe"]);
        assert!(registry.capabilities_of(CapabilityKind::Reset).is_empty());
    }

    #[test]
    fn unsupported_capability_is_reported_to_callers() {
        let mut registry = Registry::new();
        registry
            .register(noop_flash("copy", &[]).supported_when(|| false))
            .unwrap();

        assert!(!registry.is_supported(CapabilityKind::Flash, "copy"));
        // The registry itself still invokes it; support is the caller's
        // responsibility to check.
        assert!(registry.call_flash("copy", &CapabilityParams::new()).unwrap());
    }
}
