use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::statement::WriteOperation;
use crate::target::TargetStore;
use crate::{Error, Result};

/// Records every group it is asked to execute.
#[derive(Clone, Default)]
pub struct MemoryStore {
    groups: Arc<Mutex<Vec<Vec<WriteOperation>>>>,
    fail: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn groups(&self) -> Vec<Vec<WriteOperation>> {
        self.groups.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn execute_group(&mut self, group: &[WriteOperation]) -> Result<()> {
        if self.fail {
            return Err(Error::Replication {
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        self.groups.lock().unwrap().push(group.to_vec());
        Ok(())
    }
}
