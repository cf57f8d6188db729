//! Sync objects: primitives plus named operation groups

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ash::vk;

use crate::device::LogicalDevice;
use crate::error::{EngineError, EngineResult};

use super::{SyncOperations, SyncPrimitives};

/// Well-known operation group names.
///
/// An object usually wants its semaphores used in two directions: the
/// internal group describes how the object's own consumer side uses them
/// (waiting), the external group how the producer side interacts from
/// outside (signaling).
pub mod sync_groups {
    /// Consumer-side operations of the owning object
    pub const INTERNAL: &str = "InternalGroup";
    /// Producer-side operations offered to the outside
    pub const EXTERNAL: &str = "ExternalGroup";
}

static NEXT_SYNC_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`SyncObject`], usable as a map key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncObjectId(u64);

/// Signal or wait side of a group operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// The operation signals the semaphore
    Signal,
    /// The operation waits on the semaphore
    Wait,
}

#[derive(Debug, Clone)]
struct GroupOperation {
    kind: OperationKind,
    semaphore: String,
    stage_mask: vk::PipelineStageFlags2,
    /// Relative timeline value; `None` for binary semaphores
    value: Option<u64>,
}

/// Which window group operations resolve into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimelineWindow {
    Current,
    Previous,
    /// First frame of a cross-frame link: binary waits pass on the initial
    /// state, timeline waits floor at the initial value
    Initial,
}

/// Primitives coupled with named operation groups.
///
/// Groups hold relative operations; resolving a group builds a fresh
/// [`SyncOperations`] against the primitives' current timeline offsets, so
/// the same group can be replayed every frame while the absolute values keep
/// growing.
pub struct SyncObject {
    id: SyncObjectId,
    primitives: SyncPrimitives,
    groups: Mutex<HashMap<String, Vec<GroupOperation>>>,
}

impl SyncObject {
    /// Sync object without a fence
    pub fn create_empty(logical_device: LogicalDevice) -> Self {
        Self::with_primitives(SyncPrimitives::create_empty(logical_device))
    }

    /// Sync object owning a fence
    pub fn create_with_fence(logical_device: LogicalDevice, signaled: bool) -> EngineResult<Self> {
        Ok(Self::with_primitives(SyncPrimitives::create_with_fence(
            logical_device,
            signaled,
        )?))
    }

    fn with_primitives(primitives: SyncPrimitives) -> Self {
        let mut groups = HashMap::new();
        groups.insert(sync_groups::INTERNAL.to_string(), Vec::new());
        groups.insert(sync_groups::EXTERNAL.to_string(), Vec::new());
        Self {
            id: SyncObjectId(NEXT_SYNC_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            primitives,
            groups: Mutex::new(groups),
        }
    }

    /// Stable identity of this object
    pub fn id(&self) -> SyncObjectId {
        self.id
    }

    /// The owned primitives
    pub fn primitives(&self) -> &SyncPrimitives {
        &self.primitives
    }

    /// Create a binary semaphore on the owned primitives
    pub fn create_semaphore(&mut self, name: impl Into<String>) -> EngineResult<()> {
        self.primitives.create_semaphore(name)
    }

    /// Create a timeline semaphore on the owned primitives
    pub fn create_timeline_semaphore(
        &mut self,
        name: impl Into<String>,
        initial_value: u64,
        timeline_width: u64,
    ) -> EngineResult<()> {
        self.primitives
            .create_timeline_semaphore(name, initial_value, timeline_width)
    }

    /// Record a binary signal operation in a group
    pub fn add_signal_operation_to_group(
        &self,
        group_name: &str,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
    ) -> EngineResult<()> {
        self.add_operation(group_name, OperationKind::Signal, semaphore_name, stage_mask, None)
    }

    /// Record a timeline signal operation (relative `value`) in a group
    pub fn add_signal_value_operation_to_group(
        &self,
        group_name: &str,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: u64,
    ) -> EngineResult<()> {
        self.add_operation(
            group_name,
            OperationKind::Signal,
            semaphore_name,
            stage_mask,
            Some(value),
        )
    }

    /// Record a binary wait operation in a group
    pub fn add_wait_operation_to_group(
        &self,
        group_name: &str,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
    ) -> EngineResult<()> {
        self.add_operation(group_name, OperationKind::Wait, semaphore_name, stage_mask, None)
    }

    /// Record a timeline wait operation (relative `value`) in a group
    pub fn add_wait_value_operation_to_group(
        &self,
        group_name: &str,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: u64,
    ) -> EngineResult<()> {
        self.add_operation(
            group_name,
            OperationKind::Wait,
            semaphore_name,
            stage_mask,
            Some(value),
        )
    }

    /// Resolve a group against the current timeline window
    pub fn operations_group(&self, group_name: &str) -> EngineResult<SyncOperations> {
        self.resolve_group(group_name, TimelineWindow::Current)
    }

    /// Resolve a group one timeline width back.
    ///
    /// Used by cross-frame consumers: frame `i` waits on what the producer
    /// signaled in frame `i - 1`. With `first_frame` set there is no earlier
    /// producer, so wait entries resolve against the initial state: binary
    /// waits are dropped, timeline waits floor at the initial value.
    pub fn operations_group_previous_window(
        &self,
        group_name: &str,
        first_frame: bool,
    ) -> EngineResult<SyncOperations> {
        let window = if first_frame {
            TimelineWindow::Initial
        } else {
            TimelineWindow::Previous
        };
        self.resolve_group(group_name, window)
    }

    /// Host-signal a timeline semaphore at `offset + value`
    pub fn signal_semaphore(&self, name: &str, value: u64) -> EngineResult<()> {
        let semaphore = self.primitives.semaphore(name)?;
        let absolute = self.primitives.timeline_offset(name)? + value;
        self.primitives
            .logical_device()
            .dispatch()
            .signal_semaphore(semaphore, absolute)
    }

    /// Host-wait until a timeline semaphore reaches `offset + value`
    pub fn wait_semaphore(&self, name: &str, value: u64) -> EngineResult<()> {
        let semaphore = self.primitives.semaphore(name)?;
        let absolute = self.primitives.timeline_offset(name)? + value;
        self.primitives
            .logical_device()
            .dispatch()
            .wait_semaphores(&[(semaphore, absolute)], u64::MAX)
    }

    /// Current counter of a timeline semaphore
    pub fn semaphore_value(&self, name: &str) -> EngineResult<u64> {
        let semaphore = self.primitives.semaphore(name)?;
        self.primitives
            .logical_device()
            .dispatch()
            .semaphore_counter_value(semaphore)
    }

    /// Step one timeline by its width
    pub fn step_timeline(&self, name: &str) -> EngineResult<u64> {
        self.primitives.step_timeline(name)
    }

    /// Step every timeline this object owns (frame entry)
    pub fn step_all_timelines(&self) -> EngineResult<()> {
        for name in self.primitives.timeline_semaphore_names() {
            self.primitives.step_timeline(&name)?;
        }
        Ok(())
    }

    fn add_operation(
        &self,
        group_name: &str,
        kind: OperationKind,
        semaphore_name: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: Option<u64>,
    ) -> EngineResult<()> {
        // The invariant that group entries always refer to owned semaphores
        // is enforced here, not at resolve time.
        if !self.primitives.has_semaphore(semaphore_name) {
            return Err(EngineError::UnknownSemaphore {
                name: semaphore_name.to_string(),
            });
        }
        if value.is_some() && !self.primitives.has_timeline_semaphore(semaphore_name) {
            return Err(EngineError::InvalidOperation {
                reason: format!("'{semaphore_name}' is not a timeline semaphore"),
            });
        }
        self.groups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(group_name.to_string())
            .or_default()
            .push(GroupOperation {
                kind,
                semaphore: semaphore_name.to_string(),
                stage_mask,
                value,
            });
        Ok(())
    }

    fn resolve_group(&self, group_name: &str, window: TimelineWindow) -> EngineResult<SyncOperations> {
        let groups = self
            .groups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let operations = groups.get(group_name).ok_or_else(|| {
            EngineError::InvalidOperation {
                reason: format!("unknown sync group '{group_name}'"),
            }
        })?;
        let mut result = SyncOperations::default();
        for operation in operations {
            match (operation.kind, operation.value) {
                (OperationKind::Wait, None) => {
                    if window != TimelineWindow::Initial {
                        result.add_wait(&self.primitives, &operation.semaphore, operation.stage_mask)?;
                    }
                }
                (OperationKind::Signal, None) => {
                    result.add_signal(&self.primitives, &operation.semaphore, operation.stage_mask)?;
                }
                (kind, Some(value)) => match window {
                    TimelineWindow::Current => match kind {
                        OperationKind::Wait => result.add_wait_value(
                            &self.primitives,
                            &operation.semaphore,
                            operation.stage_mask,
                            value,
                        )?,
                        OperationKind::Signal => result.add_signal_value(
                            &self.primitives,
                            &operation.semaphore,
                            operation.stage_mask,
                            value,
                        )?,
                    },
                    TimelineWindow::Previous | TimelineWindow::Initial => {
                        let width = self.primitives.timeline_width(&operation.semaphore)?;
                        let offset = self.primitives.timeline_offset(&operation.semaphore)?;
                        let initial =
                            self.primitives.timeline_initial_value(&operation.semaphore)?;
                        let absolute = (offset + value).saturating_sub(width).max(initial);
                        match kind {
                            OperationKind::Wait => result.add_wait_absolute(
                                &self.primitives,
                                &operation.semaphore,
                                operation.stage_mask,
                                absolute,
                            )?,
                            // Signals always target the current window; a
                            // producer never signals into the past.
                            OperationKind::Signal => result.add_signal_value(
                                &self.primitives,
                                &operation.semaphore,
                                operation.stage_mask,
                                value,
                            )?,
                        }
                    }
                },
            }
        }
        Ok(result)
    }
}

/// Declarative recipe for a [`SyncObject`].
///
/// Graph links keep a spec instead of a live object so every in-flight slot
/// can instantiate its own, non-aliasing copy.
#[derive(Debug, Clone, Default)]
pub struct SyncObjectSpec {
    semaphores: Vec<SemaphoreDef>,
    operations: Vec<OperationDef>,
}

#[derive(Debug, Clone)]
enum SemaphoreDef {
    Binary {
        name: String,
    },
    Timeline {
        name: String,
        initial_value: u64,
        timeline_width: u64,
    },
}

#[derive(Debug, Clone)]
struct OperationDef {
    group: String,
    kind: OperationKind,
    semaphore: String,
    stage_mask: vk::PipelineStageFlags2,
    value: Option<u64>,
}

impl SyncObjectSpec {
    /// Declare a binary semaphore
    pub fn add_semaphore(&mut self, name: impl Into<String>) -> &mut Self {
        self.semaphores.push(SemaphoreDef::Binary { name: name.into() });
        self
    }

    /// Declare a timeline semaphore
    pub fn add_timeline_semaphore(
        &mut self,
        name: impl Into<String>,
        initial_value: u64,
        timeline_width: u64,
    ) -> &mut Self {
        self.semaphores.push(SemaphoreDef::Timeline {
            name: name.into(),
            initial_value,
            timeline_width,
        });
        self
    }

    /// Declare a binary signal operation
    pub fn add_signal_operation(
        &mut self,
        group: &str,
        semaphore: &str,
        stage_mask: vk::PipelineStageFlags2,
    ) -> &mut Self {
        self.operations.push(OperationDef {
            group: group.to_string(),
            kind: OperationKind::Signal,
            semaphore: semaphore.to_string(),
            stage_mask,
            value: None,
        });
        self
    }

    /// Declare a timeline signal operation with a relative value
    pub fn add_signal_value_operation(
        &mut self,
        group: &str,
        semaphore: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: u64,
    ) -> &mut Self {
        self.operations.push(OperationDef {
            group: group.to_string(),
            kind: OperationKind::Signal,
            semaphore: semaphore.to_string(),
            stage_mask,
            value: Some(value),
        });
        self
    }

    /// Declare a binary wait operation
    pub fn add_wait_operation(
        &mut self,
        group: &str,
        semaphore: &str,
        stage_mask: vk::PipelineStageFlags2,
    ) -> &mut Self {
        self.operations.push(OperationDef {
            group: group.to_string(),
            kind: OperationKind::Wait,
            semaphore: semaphore.to_string(),
            stage_mask,
            value: None,
        });
        self
    }

    /// Declare a timeline wait operation with a relative value
    pub fn add_wait_value_operation(
        &mut self,
        group: &str,
        semaphore: &str,
        stage_mask: vk::PipelineStageFlags2,
        value: u64,
    ) -> &mut Self {
        self.operations.push(OperationDef {
            group: group.to_string(),
            kind: OperationKind::Wait,
            semaphore: semaphore.to_string(),
            stage_mask,
            value: Some(value),
        });
        self
    }

    /// Whether any semaphore is declared
    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    /// Names of the declared semaphores
    pub fn semaphore_names(&self) -> Vec<&str> {
        self.semaphores
            .iter()
            .map(|def| match def {
                SemaphoreDef::Binary { name } | SemaphoreDef::Timeline { name, .. } => name.as_str(),
            })
            .collect()
    }

    /// Build a fresh sync object following this recipe
    pub fn instantiate(&self, logical_device: &LogicalDevice) -> EngineResult<SyncObject> {
        let mut object = SyncObject::create_empty(logical_device.clone());
        for semaphore in &self.semaphores {
            match semaphore {
                SemaphoreDef::Binary { name } => object.create_semaphore(name.clone())?,
                SemaphoreDef::Timeline {
                    name,
                    initial_value,
                    timeline_width,
                } => object.create_timeline_semaphore(name.clone(), *initial_value, *timeline_width)?,
            }
        }
        for operation in &self.operations {
            match (operation.kind, operation.value) {
                (OperationKind::Signal, None) => object.add_signal_operation_to_group(
                    &operation.group,
                    &operation.semaphore,
                    operation.stage_mask,
                )?,
                (OperationKind::Signal, Some(value)) => object.add_signal_value_operation_to_group(
                    &operation.group,
                    &operation.semaphore,
                    operation.stage_mask,
                    value,
                )?,
                (OperationKind::Wait, None) => object.add_wait_operation_to_group(
                    &operation.group,
                    &operation.semaphore,
                    operation.stage_mask,
                )?,
                (OperationKind::Wait, Some(value)) => object.add_wait_value_operation_to_group(
                    &operation.group,
                    &operation.semaphore,
                    operation.stage_mask,
                    value,
                )?,
            }
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;

    fn device() -> LogicalDevice {
        LogicalDevice::new(HeadlessDispatch::new())
    }

    #[test]
    fn operations_must_reference_owned_semaphores() {
        let mut object = SyncObject::create_empty(device());
        object.create_semaphore("known").unwrap();
        assert!(object
            .add_signal_operation_to_group(
                sync_groups::INTERNAL,
                "unknown",
                vk::PipelineStageFlags2::ALL_COMMANDS
            )
            .is_err());
        assert!(object
            .add_signal_operation_to_group(
                sync_groups::INTERNAL,
                "known",
                vk::PipelineStageFlags2::ALL_COMMANDS
            )
            .is_ok());
    }

    #[test]
    fn group_resolution_follows_the_timeline_window() {
        let mut object = SyncObject::create_empty(device());
        object.create_timeline_semaphore("frame", 0, 4).unwrap();
        object
            .add_wait_value_operation_to_group(
                sync_groups::INTERNAL,
                "frame",
                vk::PipelineStageFlags2::ALL_COMMANDS,
                2,
            )
            .unwrap();

        let waits = |ops: SyncOperations| ops.timeline_waits()[0].1;
        assert_eq!(waits(object.operations_group(sync_groups::INTERNAL).unwrap()), 2);
        object.step_timeline("frame").unwrap();
        assert_eq!(waits(object.operations_group(sync_groups::INTERNAL).unwrap()), 6);
        object.step_timeline("frame").unwrap();
        assert_eq!(waits(object.operations_group(sync_groups::INTERNAL).unwrap()), 10);
    }

    #[test]
    fn previous_window_floors_at_the_initial_value() {
        let mut object = SyncObject::create_empty(device());
        object.create_timeline_semaphore("finish", 0, 1).unwrap();
        object
            .add_wait_value_operation_to_group(
                sync_groups::EXTERNAL,
                "finish",
                vk::PipelineStageFlags2::ALL_COMMANDS,
                1,
            )
            .unwrap();

        // Frame 0: the shifted wait resolves to the initial state.
        let frame0 = object
            .operations_group_previous_window(sync_groups::EXTERNAL, true)
            .unwrap();
        assert_eq!(frame0.timeline_waits()[0].1, 0);

        // Frame 1 waits on frame 0's signal.
        object.step_timeline("finish").unwrap();
        let frame1 = object
            .operations_group_previous_window(sync_groups::EXTERNAL, false)
            .unwrap();
        assert_eq!(frame1.timeline_waits()[0].1, 1);
    }

    #[test]
    fn spec_instantiations_do_not_alias() {
        let logical_device = device();
        let mut spec = SyncObjectSpec::default();
        spec.add_semaphore("ready").add_signal_operation(
            sync_groups::EXTERNAL,
            "ready",
            vk::PipelineStageFlags2::ALL_COMMANDS,
        );

        let a = spec.instantiate(&logical_device).unwrap();
        let b = spec.instantiate(&logical_device).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(
            a.primitives().semaphore("ready").unwrap(),
            b.primitives().semaphore("ready").unwrap()
        );
    }
}
