//! IPC objects: named message ports.
//!
//! An object belongs to the task that created it; only that task may
//! receive from it. Any task that can name it may send. Names live in a
//! single kernel-wide namespace.

use crate::error::{Errno, Result};
use crate::kern::Kernel;
use crate::multitasking::task::TaskId;
use crate::multitasking::thread::ThreadId;
use crate::param::MAXOBJECTS;
use alloc::collections::VecDeque;
use alloc::string::String;
use api::MAXOBJNAME;
use util::slab::Handle;

pub type ObjectId = Handle<Object>;

pub struct Object {
    pub owner: TaskId,
    pub name: String,
    /// Threads blocked sending to this object.
    pub sendq: VecDeque<ThreadId>,
    /// Threads blocked receiving on this object.
    pub recvq: VecDeque<ThreadId>,
}

impl Kernel {
    /// Create an object named `name` owned by the current task.
    pub fn object_create(&mut self, name: &str) -> Result<ObjectId> {
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }
        if name.len() >= MAXOBJNAME {
            return Err(Errno::ENAMETOOLONG);
        }

        self.sched_lock();
        let r = (|| {
            let curtask = self.cur().task;
            if self.tasks.get(curtask).unwrap().objects.len() >= MAXOBJECTS {
                return Err(Errno::EAGAIN);
            }
            if self.objects.iter().any(|(_, o)| o.name == name) {
                return Err(Errno::EEXIST);
            }
            let obj = self.objects.insert(Object {
                owner: curtask,
                name: String::from(name),
                sendq: VecDeque::new(),
                recvq: VecDeque::new(),
            });
            self.tasks.get_mut(curtask).unwrap().objects.push(obj);
            Ok(obj)
        })();
        self.sched_unlock();
        r
    }

    /// Find an object by name anywhere in the system.
    pub fn object_lookup(&mut self, name: &str) -> Result<ObjectId> {
        self.sched_lock();
        let r = self
            .objects
            .iter()
            .find(|(_, o)| o.name == name)
            .map(|(h, _)| h)
            .ok_or(Errno::ENOENT);
        self.sched_unlock();
        r
    }

    /// Delete an object. Every thread queued on it is woken with an
    /// invalid-object result.
    pub fn object_destroy(&mut self, obj: ObjectId) -> Result<()> {
        self.sched_lock();
        let r = (|| {
            let o = self.objects.get(obj).ok_or(Errno::EINVAL)?;
            if o.owner != self.cur().task {
                return Err(Errno::EACCES);
            }
            self.msg_abort(obj);
            let owner = self.objects.get(obj).unwrap().owner;
            if let Some(task) = self.tasks.get_mut(owner) {
                task.objects.retain(|&x| x != obj);
            }
            self.objects.remove(obj);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Destroy whatever objects a dying task still owns.
    pub(crate) fn object_cleanup(&mut self, task: TaskId) {
        let objs = self.tasks.get(task).unwrap().objects.clone();
        for obj in objs {
            self.msg_abort(obj);
            self.objects.remove(obj);
        }
        self.tasks.get_mut(task).unwrap().objects.clear();
    }
}
