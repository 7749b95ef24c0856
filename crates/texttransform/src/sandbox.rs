use std::env::consts::EXE_SUFFIX;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tempfile::TempDir;

use crate::compiler::CompiledModule;
use crate::TransformError;

/// Module loads a sandbox accepts before a fresh one replaces it.
pub const DEFAULT_MAX_USES: usize = 20;

struct Sandbox {
    id: u64,
    dir: TempDir,
    uses: usize,
    handles: usize,
}

#[derive(Default)]
struct RecyclerState {
    current: Option<Sandbox>,
    /// Full sandboxes that still have live handles.
    retired: Vec<Sandbox>,
    next_id: u64,
    created: u64,
}

impl RecyclerState {
    fn find_mut(&mut self, id: u64) -> Option<&mut Sandbox> {
        if let Some(current) = self.current.as_mut().filter(|sandbox| sandbox.id == id) {
            return Some(current);
        }
        self.retired.iter_mut().find(|sandbox| sandbox.id == id)
    }
}

struct Shared {
    max_uses: usize,
    state: Mutex<RecyclerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RecyclerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        let torn_down = match state.find_mut(id) {
            Some(sandbox) => {
                sandbox.handles = sandbox.handles.saturating_sub(1);
                sandbox.handles == 0
            }
            None => false,
        };
        if !torn_down {
            return;
        }
        let sandbox = if state.current.as_ref().is_some_and(|s| s.id == id) {
            state.current.take()
        } else {
            let index = state.retired.iter().position(|s| s.id == id);
            index.map(|index| state.retired.swap_remove(index))
        };
        drop(state);
        if let Some(sandbox) = sandbox {
            debug!("tearing down sandbox {} after {} load(s)", sandbox.id, sandbox.uses);
            if let Err(err) = sandbox.dir.close() {
                debug!("sandbox cleanup failed: {err}");
            }
        }
    }
}

/// Hands out handles to an isolated directory that hosts compiled modules.
/// A sandbox is replaced once it has hosted `max_uses` loads and removed as
/// soon as its last handle is released.
#[derive(Clone)]
pub struct SandboxRecycler {
    shared: Arc<Shared>,
}

impl Default for SandboxRecycler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_USES)
    }
}

impl SandboxRecycler {
    pub fn new(max_uses: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_uses: max_uses.max(1),
                state: Mutex::new(RecyclerState::default()),
            }),
        }
    }

    pub fn max_uses(&self) -> usize {
        self.shared.max_uses
    }

    /// Reserves one module load in the current sandbox. The sandbox is
    /// retired as soon as its last load is reserved.
    pub fn acquire(&self) -> Result<SandboxHandle, TransformError> {
        let mut state = self.shared.lock();
        let mut sandbox = match state.current.take() {
            Some(sandbox) => sandbox,
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("texttransform-sandbox-")
                    .tempdir()?;
                let id = state.next_id;
                state.next_id += 1;
                state.created += 1;
                debug!("created sandbox {id} at {}", dir.path().display());
                Sandbox {
                    id,
                    dir,
                    uses: 0,
                    handles: 0,
                }
            }
        };
        sandbox.uses += 1;
        sandbox.handles += 1;
        let handle = SandboxHandle {
            shared: self.shared.clone(),
            id: sandbox.id,
            load: sandbox.uses,
            dir: sandbox.dir.path().to_path_buf(),
        };
        if sandbox.uses >= self.shared.max_uses {
            debug!("retiring sandbox {} after {} load(s)", sandbox.id, sandbox.uses);
            state.retired.push(sandbox);
        } else {
            state.current = Some(sandbox);
        }
        Ok(handle)
    }

    /// Sandboxes that still exist, current one included.
    pub fn live_sandboxes(&self) -> usize {
        let state = self.shared.lock();
        state.retired.len() + usize::from(state.current.is_some())
    }

    pub fn created_sandboxes(&self) -> u64 {
        self.shared.lock().created
    }
}

/// One reserved load in a sandbox. Dropping the last handle of a sandbox
/// removes it.
pub struct SandboxHandle {
    shared: Arc<Shared>,
    id: u64,
    load: usize,
    dir: PathBuf,
}

impl SandboxHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Copies the module binary into the sandbox under this handle's load
    /// slot.
    pub fn load_module(&self, module: &CompiledModule) -> Result<PathBuf, TransformError> {
        let target = self.dir.join(format!("module-{}{EXE_SUFFIX}", self.load));
        fs::copy(&module.path, &target)?;
        debug!("loaded {} into sandbox {} as {}", module.path.display(), self.id, target.display());
        Ok(target)
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}
