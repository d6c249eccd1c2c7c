use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};

use resbus_events::QueueError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::error;

use crate::manager::ResourceManager;

/// Work to run on the tick thread
pub type Task = Box<dyn FnOnce(&ResourceManager) + Send>;

/// Posts closures to run at the start of the next tick
#[derive(Clone)]
pub struct TaskSender {
    tx: UnboundedSender<Task>,
}

impl TaskSender {
    pub fn post<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce(&ResourceManager) + Send + 'static,
    {
        self.tx.send(Box::new(task)).map_err(|_| QueueError::Closed)
    }
}

impl std::fmt::Debug for TaskSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

pub(crate) struct TaskQueue {
    tx: UnboundedSender<Task>,
    rx: RefCell<UnboundedReceiver<Task>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: RefCell::new(rx),
        }
    }

    pub(crate) fn sender(&self) -> TaskSender {
        TaskSender {
            tx: self.tx.clone(),
        }
    }

    /// Run the tasks queued so far in FIFO order
    ///
    /// Tasks posted while these run wait for the next call.
    pub(crate) fn run(&self, manager: &ResourceManager) -> usize {
        let tasks: Vec<Task> = {
            let mut rx = self.rx.borrow_mut();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let count = tasks.len();
        for task in tasks {
            if let Err(e) = catch_unwind(AssertUnwindSafe(|| task(manager))) {
                error!(target: "runner", "Posted task panicked: {:?}", e);
            }
        }
        count
    }
}
