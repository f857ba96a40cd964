//! Built-in resource types.

mod dns_record;
mod keypair;
mod none;
mod object;
mod security_group;
mod vm;
mod volume;

use std::sync::Arc;

use crate::provider::ObjectStatus;

use super::{Resource, ResourceContext, ResourceRegistry, ResourceState};

pub use dns_record::DnsRecordResource;
pub use keypair::KeyPairResource;
pub use none::NoneMachine;
pub use security_group::SecurityGroupResource;
pub use vm::VmResource;
pub use volume::VolumeResource;

/// Type tag of pre-existing hosts.
pub const TYPE_NONE: &str = "none";
/// Type tag of virtual machines.
pub const TYPE_VM: &str = "vm";
/// Type tag of block volumes.
pub const TYPE_VOLUME: &str = "volume";
/// Type tag of SSH key pairs.
pub const TYPE_KEYPAIR: &str = "keypair";
/// Type tag of security groups.
pub const TYPE_SECURITY_GROUP: &str = "security-group";
/// Type tag of DNS records.
pub const TYPE_DNS_RECORD: &str = "dns-record";

/// Registers every built-in type.
pub fn register_all(registry: &mut ResourceRegistry) {
    registry.register(TYPE_NONE, |ctx: ResourceContext| -> Arc<dyn Resource> {
        Arc::new(NoneMachine::new(ctx))
    });
    registry.register(TYPE_VM, |ctx: ResourceContext| -> Arc<dyn Resource> {
        Arc::new(VmResource::new(ctx))
    });
    registry.register(TYPE_VOLUME, |ctx: ResourceContext| -> Arc<dyn Resource> {
        Arc::new(VolumeResource::new(ctx))
    });
    registry.register(TYPE_KEYPAIR, |ctx: ResourceContext| -> Arc<dyn Resource> {
        Arc::new(KeyPairResource::new(ctx))
    });
    registry.register(TYPE_SECURITY_GROUP, |ctx: ResourceContext| -> Arc<dyn Resource> {
        Arc::new(SecurityGroupResource::new(ctx))
    });
    registry.register(TYPE_DNS_RECORD, |ctx: ResourceContext| -> Arc<dyn Resource> {
        Arc::new(DnsRecordResource::new(ctx))
    });
}

/// Lifecycle state implied by a provider status.
#[must_use]
pub const fn state_for(status: ObjectStatus) -> ResourceState {
    match status {
        ObjectStatus::Running | ObjectStatus::Available | ObjectStatus::InUse => ResourceState::Up,
        ObjectStatus::Pending => ResourceState::Starting,
        ObjectStatus::Stopping => ResourceState::Stopping,
        ObjectStatus::Stopped => ResourceState::Stopped,
        ObjectStatus::Deleting | ObjectStatus::Deleted => ResourceState::Missing,
        ObjectStatus::Unknown => ResourceState::Unknown,
    }
}
