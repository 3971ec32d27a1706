//! VMM - Virtual machine backends.
//!
//! A backend provisions, inspects and destroys the VM behind one sandbox.

mod controller;
mod ec2;
mod gce;
mod provider;
mod spec;
mod virtualbox;

pub use controller::{CliController, CommandFailure};
pub use ec2::{parse_instance_state, Ec2Backend, Ec2ImageCatalog, EC2_BACKEND};
pub use gce::{parse_instance_status, GceBackend, GceImageCatalog, GCE_BACKEND};
pub use provider::VmBackend;
pub use spec::{VmHandle, VmSpec, VmState};
pub use virtualbox::{parse_guest_property, parse_vm_state, VirtualBoxBackend, VIRTUALBOX_BACKEND};
