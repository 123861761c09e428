// ── Printer registry ──
//
// Ordered map of printer id to live `Printer`. Insertion order defines
// "first registered". All mutation goes through one lock; readers get
// cheap `Printer` clones.

use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::info;

use sdcp_core::Printer;

pub struct Registry {
    printers: RwLock<IndexMap<String, Printer>>,
    size: watch::Sender<usize>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (size, _) = watch::channel(0);
        Self {
            printers: RwLock::new(IndexMap::new()),
            size,
        }
    }

    /// Add a printer under its device id. The first registration of an id
    /// wins; a duplicate is handed back.
    pub fn insert(&self, printer: Printer) -> Result<(), Printer> {
        let id = printer.device().id.clone();
        let mut printers = self.printers.write().unwrap_or_else(PoisonError::into_inner);
        if printers.contains_key(&id) {
            return Err(printer);
        }
        info!(printer = %id, host = %printer.device().host, "printer registered");
        printers.insert(id, printer);
        self.size.send_replace(printers.len());
        Ok(())
    }

    /// Remove a printer. Order of the remaining entries is preserved.
    pub fn remove(&self, id: &str) -> Option<Printer> {
        let mut printers = self.printers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = printers.shift_remove(id);
        if removed.is_some() {
            info!(printer = %id, "printer unregistered");
            self.size.send_replace(printers.len());
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Printer> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn first(&self) -> Option<Printer> {
        self.read().first().map(|(_, printer)| printer.clone())
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn printers(&self) -> Vec<Printer> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registry size, updated on every insert and removal.
    pub fn subscribe_size(&self) -> watch::Receiver<usize> {
        self.size.subscribe()
    }

    /// Remove every printer, returning them in registration order.
    pub fn drain(&self) -> Vec<Printer> {
        let mut printers = self.printers.write().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<Printer> = printers.drain(..).map(|(_, printer)| printer).collect();
        self.size.send_replace(0);
        drained
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexMap<String, Printer>> {
        self.printers.read().unwrap_or_else(PoisonError::into_inner)
    }
}
