//! Synchronous message passing.
//!
//! Transmission is fully synchronous: a sender blocks until the receiver
//! has replied, a receiver blocks until a message arrives. The message
//! body is copied from thread to thread with no kernel buffering; the
//! sender's buffer is reached through the kernel window of its mapping
//! (nothing pages out, so that window is always valid). The kernel stamps
//! the sender's task handle into the header, so receivers can trust it.
//!
//! A receiver handles one message at a time, but may itself send to
//! another object while holding it, which is how servers forward
//! requests. Queues are not FIFO: the highest-priority queued thread is
//! always taken first.

use crate::error::{Errno, Result};
use crate::ipc::object::ObjectId;
use crate::kern::Kernel;
use crate::machine::Vaddr;
use crate::memory::vm::user_area;
use crate::multitasking::scheduler::SleepResult;
use crate::multitasking::thread::ThreadId;
use alloc::collections::VecDeque;
use alloc::vec;
use api::MsgHeader;

const HDR_SIZE: usize = core::mem::size_of::<MsgHeader>();

impl Kernel {
    /// Send a message and wait for the reply.
    pub fn msg_send(&mut self, obj: ObjectId, msg: Vaddr, size: usize) -> Result<()> {
        if !user_area(msg, size) {
            return Err(Errno::EFAULT);
        }
        if size < HDR_SIZE {
            return Err(Errno::EINVAL);
        }

        self.sched_lock();
        let rc = (|| {
            if !self.objects.contains(obj) {
                return Err(Errno::EINVAL);
            }
            // sending to the object we are receiving on can only deadlock
            if self.cur().recvobj == Some(obj) {
                return Err(Errno::EDEADLK);
            }

            // pin down the kernel-window view of the message so the
            // receiver can copy from it while we sleep
            let kmsg = self.kmem_map_user(msg, size).ok_or(Errno::EFAULT)? as usize;
            let curtask = self.cur().task;
            {
                let cur = self.cur_mut();
                cur.msgaddr = kmsg;
                cur.msgsize = size;
            }
            unsafe {
                (*(kmsg as *mut MsgHeader)).task = curtask.encode();
            }

            // hand the highest-priority receiver a chance at the message
            if !self.objects.get(obj).unwrap().recvq.is_empty() {
                let t = self.msg_dequeue(obj, false);
                self.sched_unsleep(t, SleepResult::Success);
            }

            let cur = self.curthread;
            self.cur_mut().sendobj = Some(obj);
            self.objects.get_mut(obj).unwrap().sendq.push_back(cur);

            // do not touch the object after this sleep: it may be gone
            let rc = self.sched_sleep(self.ipc_event);
            if rc == SleepResult::Intr {
                if let Some(o) = self.objects.get_mut(obj) {
                    if let Some(pos) = o.sendq.iter().position(|&x| x == cur) {
                        o.sendq.remove(pos);
                    }
                }
            }
            self.cur_mut().sendobj = None;

            match rc {
                SleepResult::Break => Err(Errno::EAGAIN), // receiver died
                SleepResult::Inval => Err(Errno::EINVAL), // object deleted
                SleepResult::Intr => Err(Errno::EINTR),   // exception
                _ => Ok(()),
            }
        })();
        self.sched_unlock();
        rc
    }

    /// Receive a message from an object the current task owns. The
    /// message is clipped to `size` bytes; the sender stays blocked until
    /// `msg_reply`.
    pub fn msg_receive(&mut self, obj: ObjectId, msg: Vaddr, size: usize) -> Result<()> {
        if !user_area(msg, size) {
            return Err(Errno::EFAULT);
        }

        self.sched_lock();
        let r = (|| {
            let o = self.objects.get(obj).ok_or(Errno::EINVAL)?;
            if o.owner != self.cur().task {
                return Err(Errno::EACCES);
            }
            // one receive at a time per thread
            if self.cur().recvobj.is_some() {
                return Err(Errno::EBUSY);
            }
            let cur = self.curthread;
            self.cur_mut().recvobj = Some(obj);

            // wait until a sender shows up; even after a wakeup the
            // message may have been taken by a higher-priority receiver,
            // so re-check the queue every time
            loop {
                let Some(o) = self.objects.get(obj) else {
                    self.cur_mut().recvobj = None;
                    return Err(Errno::EINVAL);
                };
                if !o.sendq.is_empty() {
                    break;
                }
                self.objects.get_mut(obj).unwrap().recvq.push_back(cur);
                let rc = self.sched_sleep(self.ipc_event);
                match rc {
                    SleepResult::Success => continue,
                    SleepResult::Inval => {
                        self.cur_mut().recvobj = None;
                        return Err(Errno::EINVAL);
                    }
                    SleepResult::Intr => {
                        if let Some(o) = self.objects.get_mut(obj) {
                            if let Some(pos) = o.recvq.iter().position(|&x| x == cur) {
                                o.recvq.remove(pos);
                            }
                        }
                        self.cur_mut().recvobj = None;
                        return Err(Errno::EINTR);
                    }
                    _ => panic!("msg_receive: bad sleep result"),
                }
            }

            let sender = self.msg_dequeue(obj, true);
            let (src, len) = {
                let s = self.threads.get(sender).unwrap();
                (s.msgaddr, size.min(s.msgsize))
            };
            if len > 0 {
                let buf = unsafe { core::slice::from_raw_parts(src as *const u8, len) };
                if self.machine.copyout(buf, msg).is_err() {
                    self.objects.get_mut(obj).unwrap().sendq.push_back(sender);
                    self.cur_mut().recvobj = None;
                    return Err(Errno::EFAULT);
                }
            }
            // tie sender and receiver together until the reply
            self.cur_mut().sender = Some(sender);
            self.threads.get_mut(sender).unwrap().receiver = Some(cur);
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Reply to the message being received: copy into the sender's
    /// buffer, wake it, and clear the rendezvous on both sides.
    pub fn msg_reply(&mut self, obj: ObjectId, msg: Vaddr, size: usize) -> Result<()> {
        if !user_area(msg, size) {
            return Err(Errno::EFAULT);
        }

        self.sched_lock();
        let r = (|| {
            if !self.objects.contains(obj) || self.cur().recvobj != Some(obj) {
                return Err(Errno::EINVAL);
            }
            let Some(sender) = self.cur().sender else {
                // the sender was terminated while we processed its message
                self.cur_mut().recvobj = None;
                return Err(Errno::EINVAL);
            };

            let (dst, len) = {
                let s = self.threads.get(sender).unwrap();
                (s.msgaddr, size.min(s.msgsize))
            };
            if len > 0 {
                let mut buf = vec![0u8; len];
                self.machine.copyin(msg, &mut buf).map_err(|_| Errno::EFAULT)?;
                unsafe {
                    core::ptr::copy_nonoverlapping(buf.as_ptr(), dst as *mut u8, len);
                }
            }

            self.sched_unsleep(sender, SleepResult::Success);
            self.threads.get_mut(sender).unwrap().receiver = None;
            let cur = self.cur_mut();
            cur.sender = None;
            cur.recvobj = None;
            Ok(())
        })();
        self.sched_unlock();
        r
    }

    /// Unpick a terminating thread from any IPC it is in the middle of.
    ///
    /// A sender already handed to a receiver just disappears (the
    /// receiver's reply will fail); a queued sender is unqueued. A
    /// receiver holding a sender wakes it with a broken-peer result; a
    /// queued receiver is unqueued.
    pub(crate) fn msg_cancel(&mut self, t: ThreadId) {
        self.sched_lock();

        if let Some(obj) = self.threads.get(t).unwrap().sendobj {
            if let Some(receiver) = self.threads.get(t).unwrap().receiver {
                self.threads.get_mut(receiver).unwrap().sender = None;
            } else if let Some(o) = self.objects.get_mut(obj) {
                if let Some(pos) = o.sendq.iter().position(|&x| x == t) {
                    o.sendq.remove(pos);
                }
            }
        }
        if let Some(obj) = self.threads.get(t).unwrap().recvobj {
            if let Some(sender) = self.threads.get(t).unwrap().sender {
                self.sched_unsleep(sender, SleepResult::Break);
                self.threads.get_mut(sender).unwrap().receiver = None;
            } else if let Some(o) = self.objects.get_mut(obj) {
                if let Some(pos) = o.recvq.iter().position(|&x| x == t) {
                    o.recvq.remove(pos);
                }
            }
        }
        self.sched_unlock();
    }

    /// Abort everything queued on an object about to be deleted: every
    /// sender and receiver wakes with an invalid-object result.
    pub(crate) fn msg_abort(&mut self, obj: ObjectId) {
        self.sched_lock();
        loop {
            let Some(t) = self.objects.get_mut(obj).and_then(|o| o.sendq.pop_front()) else {
                break;
            };
            self.sched_unsleep(t, SleepResult::Inval);
        }
        loop {
            let Some(t) = self.objects.get_mut(obj).and_then(|o| o.recvq.pop_front()) else {
                break;
            };
            self.sched_unsleep(t, SleepResult::Inval);
        }
        self.sched_unlock();
    }

    /// Take the highest-priority thread off an object's send or receive
    /// queue.
    fn msg_dequeue(&mut self, obj: ObjectId, send_side: bool) -> ThreadId {
        let threads = &self.threads;
        let o = self.objects.get_mut(obj).unwrap();
        let q: &mut VecDeque<ThreadId> = if send_side { &mut o.sendq } else { &mut o.recvq };
        let best = q
            .iter()
            .enumerate()
            .min_by_key(|(_, &t)| threads.get(t).unwrap().priority)
            .map(|(i, _)| i)
            .expect("msg_dequeue: empty queue");
        q.remove(best).unwrap()
    }
}
