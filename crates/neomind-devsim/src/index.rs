//! Lookup tables derived from a device's comms.

use std::collections::HashMap;

use crate::model::{Comm, Execution};

/// Name and id lookups over `Device::comms`.
///
/// Always rebuilt as a whole from the comms list, never patched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverIndex {
    /// Comm id to position in `comms`.
    pub id_to_index: HashMap<String, usize>,
    /// Desired property name to property id.
    pub desired_name_to_id: HashMap<String, String>,
    /// Desired property name to position in `comms`.
    pub desired_name_to_index: HashMap<String, usize>,
    /// Method name to method id.
    pub method_name_to_id: HashMap<String, String>,
    /// Cloud-to-device dispatch key to position in `comms`.
    pub c2d_key_to_index: HashMap<String, usize>,
    /// Direct method dispatch key to position in `comms`.
    pub direct_key_to_index: HashMap<String, usize>,
}

impl ResolverIndex {
    pub fn build(comms: &[Comm]) -> Self {
        let mut index = Self::default();
        for (i, comm) in comms.iter().enumerate() {
            index.id_to_index.insert(comm.id().to_string(), i);
            match comm {
                Comm::Property(p) => {
                    if p.is_desired() {
                        index.desired_name_to_id.insert(p.name.clone(), p.id.clone());
                        index.desired_name_to_index.insert(p.name.clone(), i);
                    }
                }
                Comm::Method(m) => {
                    index.method_name_to_id.insert(m.name.clone(), m.id.clone());
                    let key = dispatch_key(m.component_name(), &m.name);
                    match m.execution {
                        Execution::Cloud => {
                            index.c2d_key_to_index.insert(key, i);
                        }
                        Execution::Direct => {
                            index.direct_key_to_index.insert(key, i);
                        }
                    }
                }
            }
        }
        index
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.id_to_index.get(id).copied()
    }
}

/// Dispatch key of a method, `component*name` when namespaced.
pub fn dispatch_key(component: Option<&str>, name: &str) -> String {
    match component {
        Some(component) => format!("{}*{}", component, name),
        None => name.to_string(),
    }
}
