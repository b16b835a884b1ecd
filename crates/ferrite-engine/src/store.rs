//! Node state storage trait
//!
//! The orchestrator persists node and port records through this trait;
//! production deployments plug in a database-backed implementation, and
//! [`MemoryStore`] serves standalone and test use.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use ferrite_common::models::{Node, Port};
use ferrite_common::{Error, Result};

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert a new node. Fails if the id or logical name is taken.
    async fn insert_node(&self, node: &Node) -> Result<()>;

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>>;

    async fn get_node_by_name(&self, name: &str) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Overwrite an existing node record.
    async fn update_node(&self, node: &Node) -> Result<()>;

    async fn delete_node(&self, id: Uuid) -> Result<()>;

    /// Insert a port. Fails if the MAC address is already registered.
    async fn insert_port(&self, port: &Port) -> Result<()>;

    async fn list_ports(&self, node_id: Uuid) -> Result<Vec<Port>>;
}

/// In-memory store for standalone mode and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<Uuid, Node>>,
    ports: RwLock<HashMap<Uuid, Port>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&node.id) {
            return Err(Error::Validation(format!("node {} already exists", node.id)));
        }
        if let Some(name) = &node.name {
            if nodes.values().any(|n| n.name.as_deref() == Some(name)) {
                return Err(Error::Validation(format!(
                    "a node named '{name}' already exists"
                )));
            }
        }
        nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>> {
        Ok(self.nodes.read().unwrap().get(&id).cloned())
    }

    async fn get_node_by_name(&self, name: &str) -> Result<Option<Node>> {
        Ok(self
            .nodes
            .read()
            .unwrap()
            .values()
            .find(|n| n.name.as_deref() == Some(name))
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.read().unwrap().values().cloned().collect())
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        if let Some(name) = &node.name {
            if nodes
                .values()
                .any(|n| n.id != node.id && n.name.as_deref() == Some(name))
            {
                return Err(Error::Validation(format!(
                    "a node named '{name}' already exists"
                )));
            }
        }
        match nodes.get_mut(&node.id) {
            Some(existing) => {
                *existing = node.clone();
                Ok(())
            }
            None => Err(Error::node_not_found(&node.id.to_string())),
        }
    }

    async fn delete_node(&self, id: Uuid) -> Result<()> {
        let removed = self.nodes.write().unwrap().remove(&id);
        if removed.is_none() {
            return Err(Error::node_not_found(&id.to_string()));
        }
        self.ports.write().unwrap().retain(|_, p| p.node_id != id);
        Ok(())
    }

    async fn insert_port(&self, port: &Port) -> Result<()> {
        let mut ports = self.ports.write().unwrap();
        if ports
            .values()
            .any(|p| p.mac_address == port.mac_address)
        {
            return Err(Error::Validation(format!(
                "a port with MAC {} already exists",
                port.mac_address
            )));
        }
        ports.insert(port.id, port.clone());
        Ok(())
    }

    async fn list_ports(&self, node_id: Uuid) -> Result<Vec<Port>> {
        Ok(self
            .ports
            .read()
            .unwrap()
            .values()
            .filter(|p| p.node_id == node_id)
            .cloned()
            .collect())
    }
}
