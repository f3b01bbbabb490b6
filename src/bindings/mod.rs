//! Logical controls and routes built from the configuration
//!
//! Construction is all or nothing: the first lookup or allocation failure aborts it, and
//! the caller is expected to exit. On success the [`BindingManifest`] lists where every
//! logical control landed, for the binding-file generator.

use crate::config::{ConfigError, ControlConfig, LogicalKind, RouteConfig};
use crate::devices::allocator::{next_free_axis, next_free_button};
use crate::devices::channel::{ChannelKind, ChannelRef, VirtualSlot};
use crate::engine::routes::{Route, Target};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::feedback::BindingMode;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    pub slot: VirtualSlot,
    pub kind: ChannelKind,
    /// 0-based, drivers number channels from 1.
    pub index: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<BindingMode>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct BindingManifest {
    pub generated: String,
    pub controls: Vec<ManifestEntry>,
}

impl BindingManifest {
    pub fn entry(&self, name: &str) -> Option<&ManifestEntry> {
        self.controls.iter().find(|e| e.name == name)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Binding manifest written to {}", path.display());
        Ok(())
    }
}

/// Named logical outputs and the manifest describing them.
#[derive(Debug, Default)]
pub struct Bindings {
    pub targets: BTreeMap<String, Target>,
    pub manifest: BindingManifest,
}

/// Allocation policy for logical controls.
#[derive(Debug, Clone, Default)]
pub struct AllocationPolicy {
    pub ignored_slots: Vec<VirtualSlot>,
    pub feedback_button_ceiling: u8,
}

fn place(
    engine: &mut Engine,
    control: &ControlConfig,
    policy: &AllocationPolicy,
) -> Result<ChannelRef, EngineError> {
    let registry = engine.registry_mut();
    match (control.slot, control.index) {
        (Some(slot), Some(index)) => match control.kind {
            LogicalKind::Axis => registry.virtual_axis(slot, index, true),
            LogicalKind::Button | LogicalKind::FeedbackSwitch => {
                registry.virtual_button(slot, index, true)
            }
        },
        (None, None) => {
            let pool = registry.virtual_slots();
            let ignore = &policy.ignored_slots;
            match control.kind {
                LogicalKind::Axis => next_free_axis(registry, &pool, ignore, true),
                LogicalKind::Button => next_free_button(registry, &pool, ignore, None, true),
                LogicalKind::FeedbackSwitch => next_free_button(
                    registry,
                    &pool,
                    ignore,
                    Some(0..policy.feedback_button_ceiling),
                    true,
                ),
            }
        }
        _ => Err(EngineError::Binding(format!(
            "'{}' needs both slot and index, or neither",
            control.name
        ))),
    }
}

/// Register every logical control, then every route.
pub fn build(
    engine: &mut Engine,
    controls: &[ControlConfig],
    routes: &[RouteConfig],
    policy: &AllocationPolicy,
) -> Result<Bindings, EngineError> {
    let mut bindings = Bindings {
        targets: BTreeMap::new(),
        manifest: BindingManifest {
            generated: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            controls: Vec::new(),
        },
    };

    for control in controls {
        if bindings.targets.contains_key(&control.name) {
            return Err(EngineError::Binding(format!(
                "'{}' is defined twice",
                control.name
            )));
        }
        let channel = place(engine, control, policy)?;
        let slot = engine
            .registry()
            .descriptor(channel.device)
            .and_then(|d| d.virtual_slot)
            .ok_or_else(|| {
                EngineError::Binding(format!("'{}' did not land on a virtual device", control.name))
            })?;

        let (target, mode) = match (control.kind, &control.flag) {
            (LogicalKind::Axis, _) => (Target::Axis(channel.control), None),
            (LogicalKind::Button, _) => (Target::Button(channel.control), None),
            (LogicalKind::FeedbackSwitch, Some(flag)) => {
                let id =
                    engine.add_feedback_switch(&control.name, channel.control, flag, control.mode)?;
                (Target::Switch(id), Some(control.mode))
            }
            (LogicalKind::FeedbackSwitch, None) => {
                return Err(EngineError::Binding(format!(
                    "feedback switch '{}' has no flag",
                    control.name
                )))
            }
        };
        debug!(
            "'{}' on {} {} #{}",
            control.name, slot, channel.kind, channel.index
        );
        bindings.targets.insert(control.name.clone(), target);
        bindings.manifest.controls.push(ManifestEntry {
            name: control.name.clone(),
            slot,
            kind: channel.kind,
            index: channel.index,
            mode,
        });
    }

    for route in routes {
        let target = *bindings.targets.get(&route.target).ok_or_else(|| {
            EngineError::Binding(format!("route target '{}' is not defined", route.target))
        })?;
        let registry = engine.registry_mut();
        let source = match (route.button, route.axis) {
            (Some(button), None) => registry.physical_button(&route.device, button)?,
            (None, Some(axis)) => registry.physical_axis(&route.device, axis)?,
            _ => {
                return Err(EngineError::Binding(format!(
                    "route to '{}' needs exactly one of button or axis",
                    route.target
                )))
            }
        };
        engine.add_route(
            source.control,
            Route::new(route.trigger, route.command, target)?,
        )?;
    }

    info!(
        "Bound {} logical control(s) and {} route(s)",
        bindings.targets.len(),
        routes.len()
    );
    Ok(bindings)
}
