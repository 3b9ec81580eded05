//! Kernel scenario tests.
//!
//! These drive a full `Kernel` over the mock machine. Each simulated
//! kernel thread is a host thread; a single CPU token moves between them
//! in `context_switch`, so scheduling order is exactly what the real
//! scheduler decides. The `#[test]` function itself plays the idle
//! thread: it only runs when every simulated thread is blocked, which
//! makes "run until quiescent" implicit in every call that unlocks the
//! scheduler.

use crate::machine::mock::MockMachine;
use crate::machine::{CtxReg, Pgd};
use crate::multitasking::task::TaskId;
use crate::multitasking::thread::{ThreadId, ThreadState};
use crate::param::{KSTACKSZ, PAGE_SIZE};
use crate::Kernel;
use api::{
    BootInfo, Module, Modules, Prot, RamRegions, SchedPolicy, VmInherit, EXC_ALRM, MAXTASKNAME,
    NPRI, PRI_IDLE,
};
use std::boxed::Box;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::string::String;
use std::sync::{Arc, Mutex};
use std::vec::Vec;

#[derive(Clone, Copy)]
struct KRef(*mut Kernel);

unsafe impl Send for KRef {}
unsafe impl Sync for KRef {}

impl KRef {
    fn k(self) -> &'static mut Kernel {
        unsafe { &mut *self.0 }
    }
}

/// Shared log the workers append to and the test asserts on.
type Trace = Arc<Mutex<Vec<String>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(t: &Trace, s: &str) {
    t.lock().unwrap().push(String::from(s));
}

fn taken(t: &Trace) -> Vec<String> {
    t.lock().unwrap().clone()
}

fn empty_module() -> Module {
    Module {
        name: [0; MAXTASKNAME],
        phys: 0,
        size: 0,
        text: 0,
        textsz: 0,
        data: 0,
        datasz: 0,
        bsssz: 0,
        entry: 0,
    }
}

/// Fresh kernel over 128 pages of mock RAM, boot lock released.
fn test_kernel() -> (KRef, &'static MockMachine) {
    let machine = MockMachine::leaked(128 * PAGE_SIZE);
    let regions = Box::leak(Box::new(machine.ram_regions()));
    let bootinfo = BootInfo {
        ram: unsafe { RamRegions::new(regions.as_ptr(), regions.len()) },
        driver: empty_module(),
        tasks: Modules::empty(),
    };
    let k = Kernel::new(machine, &bootinfo);
    k.sched_unlock();
    (KRef(k as *mut Kernel), machine)
}

fn user_task(kr: KRef) -> TaskId {
    let k = kr.k();
    k.task_create(k.kernel_task, VmInherit::New).unwrap()
}

type BoxedFn = Box<dyn FnOnce() + Send>;

fn worker_entry(arg: usize) {
    let data = unsafe { Box::from_raw(arg as *mut (KRef, BoxedFn)) };
    let (kr, f) = *data;
    // a panicking worker must still hand the CPU on, or the whole test
    // process wedges; the failed expectation surfaces in the trace
    let _ = catch_unwind(AssertUnwindSafe(f));
    let k = kr.k();
    k.sched_lock();
    let me = k.curthread;
    k.thread_destroy(me);
    k.sched_unlock();
    unreachable!("terminated thread kept running");
}

/// Start a kernel-entry thread in `task`. When `start` is set the thread
/// is resumed and, with a better priority than idle, runs up to its
/// first blocking point before this returns.
fn spawn(
    kr: KRef,
    task: TaskId,
    pri: i32,
    policy: SchedPolicy,
    start: bool,
    f: impl FnOnce() + Send + 'static,
) -> ThreadId {
    let k = kr.k();
    k.sched_lock();
    let t = k.thread_allocate(task).expect("spawn: thread_allocate");
    let machine = k.machine;
    let data: Box<(KRef, BoxedFn)> = Box::new((kr, Box::new(f)));
    let arg = Box::into_raw(data) as usize;
    {
        let tref = k.threads.get_mut(t).unwrap();
        let stack = tref.kstack.unwrap();
        machine.context_set(&mut tref.ctx, CtxReg::KStack, stack + KSTACKSZ);
        machine.context_set(&mut tref.ctx, CtxReg::KEntry, worker_entry as usize);
        machine.context_set(&mut tref.ctx, CtxReg::KArg, arg);
    }
    k.sched_start(t, pri, policy);
    k.threads.get_mut(t).unwrap().suscnt = 1;
    if start {
        k.sched_resume(t);
    }
    k.sched_unlock();
    t
}

fn resume(kr: KRef, t: ThreadId) {
    let k = kr.k();
    k.sched_lock();
    k.do_thread_resume(t);
    k.sched_unlock();
}

fn ticks(kr: KRef, n: u32) {
    for _ in 0..n {
        kr.k().clock_interrupt();
    }
}

fn pgd_of(kr: KRef, task: TaskId) -> Pgd {
    let k = kr.k();
    let map = k.tasks.get(task).unwrap().map;
    k.maps.get(map).unwrap().pgd
}

/// Check the cross-cutting invariants at a quiescent point.
fn audit(kr: KRef) {
    let k = kr.k();
    let mut best = PRI_IDLE;
    for pri in 0..NPRI {
        for &t in &k.runq[pri as usize] {
            let tref = k.threads.get(t).expect("runq holds a stale thread");
            assert!(tref.state.is_run(), "queued thread not runnable");
            assert_eq!(tref.priority, pri, "thread on wrong run queue");
            assert!(t != k.curthread, "current thread on a run queue");
            if pri < best {
                best = pri;
            }
        }
    }
    assert_eq!(k.maxpri, best, "maxpri cache out of date");
    assert!(k.wakeq.is_empty(), "wake queue not drained at quiescence");

    for (eid, ev) in k.events.iter() {
        for &t in &ev.sleepq {
            let tref = k.threads.get(t).expect("sleepq holds a stale thread");
            assert!(tref.state.contains(ThreadState::SLEEP));
            assert_eq!(tref.slpevt, Some(eid));
        }
    }

    for (mid, m) in k.mutexes.iter() {
        if let Some(h) = m.holder {
            let href = k.threads.get(h).expect("mutex holder gone");
            assert!(href.mutexes.contains(&mid), "holder does not list mutex");
            assert!(href.priority <= m.priority, "holder below mutex ceiling");
            for &w in &k.events.get(m.event).unwrap().sleepq {
                assert!(m.priority <= k.threads.get(w).unwrap().priority);
            }
        }
    }

    for (_, task) in k.tasks.iter() {
        if let Some(map) = k.maps.get(task.map) {
            assert_eq!(map.total, map.segs.used_bytes(), "vm total drifted");
        }
    }
}

mod multitasking_tests {
    use super::*;
    use crate::multitasking::scheduler::QUANTUM;

    #[test]
    fn test_boot_settles_to_idle() {
        let (kr, _m) = test_kernel();
        let k = kr.k();
        assert_eq!(k.curthread, k.idle_thread);
        assert_eq!(k.cur().locks, 0);
        // dpc and timer threads exist and are asleep
        assert_eq!(k.threads.len(), 3);
        audit(kr);
    }

    #[test]
    fn test_spawn_runs_by_priority() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let t1 = {
            let tr = tr.clone();
            spawn(kr, ta, 120, SchedPolicy::Fifo, false, move || {
                push(&tr, "low");
            })
        };
        let t2 = {
            let tr = tr.clone();
            spawn(kr, ta, 80, SchedPolicy::Fifo, false, move || {
                push(&tr, "high");
            })
        };
        // both paused; release together and let priority decide
        let k = kr.k();
        k.sched_lock();
        k.do_thread_resume(t1);
        k.do_thread_resume(t2);
        k.sched_unlock();

        assert_eq!(taken(&tr), ["high", "low"]);
        audit(kr);
    }

    #[test]
    fn test_round_robin_rotation() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let a = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Rr, false, move || {
                push(&tr, "A-start");
                // burn one full quantum; the expiry preempts us to B
                ticks(kr, QUANTUM as u32);
                push(&tr, "A-after");
            })
        };
        let b = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Rr, false, move || {
                push(&tr, "B-ran");
            })
        };
        let k = kr.k();
        k.sched_lock();
        k.do_thread_resume(a);
        k.do_thread_resume(b);
        k.sched_unlock();

        assert_eq!(taken(&tr), ["A-start", "B-ran", "A-after"]);
        audit(kr);
    }

    #[test]
    fn test_suspend_holds_thread_off_runq() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, false, move || {
                push(&tr, "ran");
            })
        };
        assert!(taken(&tr).is_empty());
        let k = kr.k();
        assert!(k.threads.get(t).unwrap().state.contains(ThreadState::SUSP));

        // one more suspend level: a single resume must not run it
        k.thread_suspend(t).unwrap();
        resume(kr, t);
        assert!(taken(&tr).is_empty());
        resume(kr, t);
        assert_eq!(taken(&tr), ["ran"]);
        audit(kr);
    }

    #[test]
    fn test_task_suspend_cascades() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();
        let ev = kr.k().event_create("gate");

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                push(&tr, "before");
                kr.k().sched_sleep(ev);
                push(&tr, "after");
            })
        };
        assert_eq!(taken(&tr), ["before"]);

        let k = kr.k();
        k.task_suspend(ta).unwrap();
        // waking a suspended task's thread must not run it
        k.sched_wakeup(ev);
        assert_eq!(taken(&tr), ["before"]);
        k.task_resume(ta).unwrap();
        assert_eq!(taken(&tr), ["before", "after"]);
        audit(kr);
    }

    #[test]
    fn test_zombie_reaped_by_next_exit() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);

        let t1 = spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {});
        let k = kr.k();
        // t1 terminated itself: its slot lingers in the zombie seat
        assert_eq!(k.zombie, Some(t1));
        assert!(k.threads.contains(t1));

        let t2 = spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {});
        let k = kr.k();
        assert!(!k.threads.contains(t1), "previous zombie not reaped");
        assert_eq!(k.zombie, Some(t2));
        audit(kr);
    }

    #[test]
    fn test_task_terminate_cleans_up() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let ev = kr.k().event_create("parked");

        let t = spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
            let k = kr.k();
            k.object_create("doomed").unwrap();
            let _ = k.vm_allocate(k.task_self(), 0, PAGE_SIZE, true).unwrap();
            k.sched_sleep(ev);
        });

        let k = kr.k();
        let free_before = k.pages.free_bytes();
        assert!(k.object_lookup("doomed").is_ok());
        k.task_terminate(ta).unwrap();

        let k = kr.k();
        assert!(!k.tasks.contains(ta));
        assert!(!k.threads.contains(t));
        assert!(k.object_lookup("doomed").is_err());
        // the task's page came back (plus possibly a drained heap page)
        assert!(k.pages.free_bytes() >= free_before + PAGE_SIZE as u64);
        audit(kr);
    }

    #[test]
    fn test_exception_wait_and_raise() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.exception_setup(0x5000).unwrap();
                match k.exception_wait() {
                    Ok(excno) => push(&tr, &std::format!("exc={}", excno)),
                    Err(e) => push(&tr, &std::format!("err={}", e)),
                }
            })
        };
        assert!(taken(&tr).is_empty());

        let k = kr.k();
        k.exception_raise(ta, EXC_ALRM).unwrap();
        assert_eq!(taken(&tr), [std::format!("exc={}", EXC_ALRM)]);
        audit(kr);
    }

    #[test]
    fn test_exception_deliver_redirects_context() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.exception_setup(0x5000).unwrap();
                k.exception_mark(EXC_ALRM);
                k.exception_deliver();
                let words = k.cur().ctx.words;
                push(&tr, &std::format!("entry={:#x} arg={}", words[4], words[6]));
                assert_eq!(k.cur().excbits, 0);
                k.exception_return();
                push(&tr, &std::format!("restored={:#x}", k.cur().ctx.words[4]));
            })
        };
        // the handler entry was patched in, then restored (mock keeps
        // UEntry in word 4 and UArg in word 6; it was zero before)
        assert_eq!(
            taken(&tr),
            [
                std::format!("entry={:#x} arg={}", 0x5000, EXC_ALRM),
                String::from("restored=0x0"),
            ]
        );
    }
}

mod sync_tests {
    use super::*;

    /// L (150) holds the mutex, H (50) blocks on it, M
    /// (100) must not get in between while L is boosted.
    #[test]
    fn test_priority_inheritance_chain() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();
        let mu = Arc::new(Mutex::new(None));
        let k = kr.k();
        let ev_l = k.event_create("go-l");
        let ev_m = k.event_create("go-m");
        let ev_h = k.event_create("go-h");

        let l = {
            let (tr, mu) = (tr.clone(), mu.clone());
            spawn(kr, ta, 150, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let m = k.mutex_init().unwrap();
                *mu.lock().unwrap() = Some(m);
                k.mutex_lock(m).unwrap();
                push(&tr, "L:locked");
                k.sched_sleep(ev_l);
                push(&tr, &std::format!("L:resumed pri={}", k.cur().priority));
                k.mutex_unlock(m).unwrap();
                push(&tr, &std::format!("L:unlocked pri={}", k.cur().priority));
            })
        };
        let _mid = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                kr.k().sched_sleep(ev_m);
                push(&tr, "M:ran");
            })
        };
        let _h = {
            let (tr, mu) = (tr.clone(), mu.clone());
            spawn(kr, ta, 50, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.sched_sleep(ev_h);
                push(&tr, "H:lock");
                let m = mu.lock().unwrap().unwrap();
                k.mutex_lock(m).unwrap();
                push(&tr, "H:locked");
                k.mutex_unlock(m).unwrap();
            })
        };

        // let H contend: L must inherit priority 50
        kr.k().sched_wakeup(ev_h);
        let k = kr.k();
        assert_eq!(k.threads.get(l).unwrap().priority, 50);
        assert_eq!(k.threads.get(l).unwrap().basepri, 150);
        let m = mu.lock().unwrap().unwrap();
        assert_eq!(k.mutexes.get(m).unwrap().priority, 50);
        audit(kr);

        // wake L (boosted, runs ahead of M); M last
        k.sched_wakeup(ev_l);
        k.sched_wakeup(ev_m);

        assert_eq!(
            taken(&tr),
            [
                "L:locked",
                "H:lock",
                "L:resumed pri=50",
                "H:locked",
                "L:unlocked pri=150",
                "M:ran",
            ]
        );
        audit(kr);
    }

    #[test]
    fn test_mutex_recursion_round_trip() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let m = k.mutex_init().unwrap();
                for _ in 0..64 {
                    k.mutex_lock(m).unwrap();
                }
                for _ in 0..63 {
                    k.mutex_unlock(m).unwrap();
                }
                // still held after n-1 unlocks
                assert_eq!(k.mutexes.get(m).unwrap().holder, Some(k.curthread));
                k.mutex_unlock(m).unwrap();
                assert_eq!(k.mutexes.get(m).unwrap().holder, None);
                assert_eq!(k.mutex_unlock(m), Err(api::Errno::EPERM));
                push(&tr, "done");
            })
        };
        assert_eq!(taken(&tr), ["done"]);
    }

    #[test]
    fn test_mutex_deadlock_detected() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();
        let pair = Arc::new(Mutex::new(None));
        let ev_a = kr.k().event_create("dl-a");

        let _a = {
            let (tr, pair) = (tr.clone(), pair.clone());
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let m1 = k.mutex_init().unwrap();
                let m2 = k.mutex_init().unwrap();
                *pair.lock().unwrap() = Some((m1, m2));
                k.mutex_lock(m1).unwrap();
                k.sched_sleep(ev_a);
                // blocks on m2 held by B; no cycle yet
                push(&tr, &std::format!("A:{:?}", k.mutex_lock(m2)));
                k.mutex_unlock(m1).unwrap();
            })
        };
        let _b = {
            let (tr, pair) = (tr.clone(), pair.clone());
            spawn(kr, ta, 110, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let (m1, m2) = pair.lock().unwrap().unwrap();
                k.mutex_lock(m2).unwrap();
                k.sched_wakeup(ev_a);
                // A now waits on m2 while holding m1: this lock would
                // close the cycle and must fail
                push(&tr, &std::format!("B:{:?}", k.mutex_lock(m1)));
                k.mutex_unlock(m2).unwrap();
            })
        };

        let got = taken(&tr);
        assert_eq!(got, ["B:Err(EDEADLK)", "A:Ok(())"]);
        audit(kr);
    }

    #[test]
    fn test_sem_counts_and_blocks() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();
        let sem_cell = Arc::new(Mutex::new(None));

        let _a = {
            let (tr, sem_cell) = (tr.clone(), sem_cell.clone());
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let s = k.sem_init(1).unwrap();
                *sem_cell.lock().unwrap() = Some(s);
                k.sem_wait(s).unwrap();
                push(&tr, "A:got-1");
                assert_eq!(k.sem_trywait(s), Err(api::Errno::EAGAIN));
                // blocks until B posts
                k.sem_wait(s).unwrap();
                push(&tr, "A:got-2");
            })
        };
        let _b = {
            let (tr, sem_cell) = (tr.clone(), sem_cell.clone());
            spawn(kr, ta, 120, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let s = sem_cell.lock().unwrap().unwrap();
                push(&tr, "B:post");
                k.sem_post(s).unwrap();
            })
        };

        assert_eq!(taken(&tr), ["A:got-1", "B:post", "A:got-2"]);
        audit(kr);
    }

    #[test]
    fn test_cond_signal_wakes_waiter() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();
        let cell = Arc::new(Mutex::new(None));

        let _w = {
            let (tr, cell) = (tr.clone(), cell.clone());
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let m = k.mutex_init().unwrap();
                let c = k.cond_init().unwrap();
                *cell.lock().unwrap() = Some((m, c));
                k.mutex_lock(m).unwrap();
                push(&tr, "W:wait");
                k.cond_wait(c, m).unwrap();
                // the mutex is ours again
                assert_eq!(k.mutexes.get(m).unwrap().holder, Some(k.curthread));
                push(&tr, "W:woke");
                k.mutex_unlock(m).unwrap();
            })
        };
        let _s = {
            let (tr, cell) = (tr.clone(), cell.clone());
            spawn(kr, ta, 120, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let (m, c) = cell.lock().unwrap().unwrap();
                k.mutex_lock(m).unwrap();
                push(&tr, "S:signal");
                k.cond_signal(c).unwrap();
                k.mutex_unlock(m).unwrap();
            })
        };

        assert_eq!(taken(&tr), ["W:wait", "S:signal", "W:woke"]);
        audit(kr);
    }
}

mod ipc_tests {
    use super::*;
    use api::MsgHeader;

    const HDR: usize = core::mem::size_of::<MsgHeader>();

    fn compose(payload: &[u8]) -> Vec<u8> {
        let mut msg = std::vec![0u8; HDR + payload.len()];
        msg[HDR..].copy_from_slice(payload);
        msg
    }

    /// A sends while B is not receiving; A blocks; B's
    /// receive completes with A's message; A stays blocked until the
    /// reply and then sees the reply bytes.
    #[test]
    fn test_rendezvous_send_receive_reply() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tb = user_task(kr);
        let tr = trace();
        let ev_b = kr.k().event_create("b-hold");

        let _b = {
            let tr = tr.clone();
            spawn(kr, tb, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.object_create("port").unwrap();
                k.sched_sleep(ev_b); // not receiving yet
                let obj = k.object_lookup("port").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 256, true).unwrap();
                let rc = k.msg_receive(obj, buf, 256);
                push(&tr, &std::format!("B:recv={:?}", rc));

                let mut got = std::vec![0u8; HDR + 4];
                k.machine.copyin(buf, &mut got).unwrap();
                let sender = u64::from_ne_bytes(got[..8].try_into().unwrap());
                push(
                    &tr,
                    &std::format!(
                        "B:from-a={} body={}",
                        sender == ta.encode(),
                        core::str::from_utf8(&got[HDR..]).unwrap()
                    ),
                );

                let reply = compose(b"pong");
                k.machine.copyout(&reply, buf).unwrap();
                let rc = k.msg_reply(obj, buf, reply.len());
                push(&tr, &std::format!("B:reply={:?}", rc));
            })
        };

        let a = {
            let tr = tr.clone();
            spawn(kr, ta, 110, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let obj = k.object_lookup("port").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 256, true).unwrap();
                let msg = compose(b"ping");
                k.machine.copyout(&msg, buf).unwrap();
                let rc = k.msg_send(obj, buf, msg.len());
                push(&tr, &std::format!("A:send={:?}", rc));

                let mut back = std::vec![0u8; HDR + 4];
                k.machine.copyin(buf, &mut back).unwrap();
                push(
                    &tr,
                    &std::format!("A:reply-body={}", core::str::from_utf8(&back[HDR..]).unwrap()),
                );
            })
        };

        // A is parked in the send queue; B is still holding off
        let k = kr.k();
        assert!(k.threads.get(a).unwrap().state.contains(ThreadState::SLEEP));
        let obj = k.object_lookup("port").unwrap();
        assert_eq!(k.objects.get(obj).unwrap().sendq.len(), 1);
        assert!(taken(&tr).is_empty());

        k.sched_wakeup(ev_b);
        assert_eq!(
            taken(&tr),
            [
                "B:recv=Ok(())",
                "B:from-a=true body=ping",
                "B:reply=Ok(())",
                "A:send=Ok(())",
                "A:reply-body=pong",
            ]
        );
        audit(kr);
    }

    /// The send/receive queues hand out the highest-priority thread, not
    /// the oldest.
    #[test]
    fn test_send_queue_is_priority_ordered() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tb = user_task(kr);
        let tr = trace();
        let ev_b = kr.k().event_create("b-hold");

        let _b = {
            let tr = tr.clone();
            spawn(kr, tb, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.object_create("prioq").unwrap();
                k.sched_sleep(ev_b);
                let obj = k.object_lookup("prioq").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 256, true).unwrap();
                for _ in 0..2 {
                    k.msg_receive(obj, buf, 256).unwrap();
                    let mut got = std::vec![0u8; HDR + 2];
                    k.machine.copyin(buf, &mut got).unwrap();
                    push(
                        &tr,
                        &std::format!("B:got={}", core::str::from_utf8(&got[HDR..]).unwrap()),
                    );
                    k.msg_reply(obj, buf, 0).unwrap();
                }
            })
        };

        let send_worker = |pri: i32, body: &'static [u8; 2]| {
            spawn(kr, ta, pri, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let obj = k.object_lookup("prioq").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 64, true).unwrap();
                let msg = compose(body);
                k.machine.copyout(&msg, buf).unwrap();
                k.msg_send(obj, buf, msg.len()).unwrap();
            })
        };
        let _s1 = send_worker(120, b"s1");
        let _s2 = send_worker(80, b"s2");

        kr.k().sched_wakeup(ev_b);
        // the higher-priority sender s2 goes first even though s1 queued
        // earlier
        assert_eq!(taken(&tr), ["B:got=s2", "B:got=s1"]);
        audit(kr);
    }

    /// An object deleted under a queued sender and receiver:
    /// both come back with EINVAL and the queues are gone.
    #[test]
    fn test_object_delete_cancels_queued_threads() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tb = user_task(kr);
        let tr = trace();
        let ev_d = kr.k().event_create("deleter");

        // D owns the object and will delete it while S and R are queued
        let _d = {
            let tr = tr.clone();
            spawn(kr, tb, 50, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.object_create("victim").unwrap();
                k.sched_sleep(ev_d);
                let obj = k.object_lookup("victim").unwrap();
                push(&tr, &std::format!("D:destroy={:?}", k.object_destroy(obj)));
            })
        };
        let _r = {
            let tr = tr.clone();
            spawn(kr, tb, 120, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let obj = k.object_lookup("victim").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 64, true).unwrap();
                push(&tr, &std::format!("R:recv={:?}", k.msg_receive(obj, buf, 64)));
            })
        };
        let _s = {
            let tr = tr.clone();
            spawn(kr, ta, 110, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let obj = k.object_lookup("victim").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 64, true).unwrap();
                let msg = compose(b"xx");
                k.machine.copyout(&msg, buf).unwrap();
                // make the deleter runnable, then block in the send in
                // one locked region: the delete lands exactly while we
                // sit in the send queue
                k.sched_lock();
                k.sched_wakeup(ev_d);
                let rc = k.msg_send(obj, buf, msg.len());
                k.sched_unlock();
                push(&tr, &std::format!("S:send={:?}", rc));
            })
        };

        let got = taken(&tr);
        assert!(got.contains(&String::from("D:destroy=Ok(())")), "{:?}", got);
        assert!(got.contains(&String::from("S:send=Err(EINVAL)")), "{:?}", got);
        assert!(got.contains(&String::from("R:recv=Err(EINVAL)")), "{:?}", got);
        assert!(kr.k().object_lookup("victim").is_err());
        audit(kr);
    }

    #[test]
    fn test_sender_termination_breaks_receiver() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tb = user_task(kr);
        let tr = trace();
        let ev_b = kr.k().event_create("b-hold");
        let ev_b2 = kr.k().event_create("b-hold2");

        let _b = {
            let tr = tr.clone();
            spawn(kr, tb, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.object_create("halfway").unwrap();
                k.sched_sleep(ev_b);
                let obj = k.object_lookup("halfway").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 64, true).unwrap();
                let rc = k.msg_receive(obj, buf, 64);
                push(&tr, &std::format!("B:recv={:?}", rc));
                // hold here so the test can kill the sender mid-exchange
                k.sched_sleep(ev_b2);
                let rc = k.msg_reply(obj, buf, 0);
                push(&tr, &std::format!("B:reply={:?}", rc));
            })
        };
        let s = {
            spawn(kr, ta, 110, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let obj = k.object_lookup("halfway").unwrap();
                let buf = k.vm_allocate(k.task_self(), 0, 64, true).unwrap();
                let msg = compose(b"zz");
                k.machine.copyout(&msg, buf).unwrap();
                let _ = k.msg_send(obj, buf, msg.len());
                unreachable!("sender was terminated while blocked");
            })
        };

        let k = kr.k();
        k.sched_wakeup(ev_b);
        // B holds the message, S still awaits the reply; kill S
        assert_eq!(taken(&tr), ["B:recv=Ok(())"]);
        k.thread_terminate(s).unwrap();
        k.sched_wakeup(ev_b2);
        assert_eq!(taken(&tr), ["B:recv=Ok(())", "B:reply=Err(EINVAL)"]);
        audit(kr);
    }
}

mod timer_tests {
    use super::*;
    use crate::timer::TimerState;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// A 100 ms sleep poked by an exception after 30 ms
    /// returns with at least 70 ms left.
    #[test]
    fn test_delay_interrupted_reports_remainder() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.exception_setup(0x5000).unwrap();
                let remain = k.timer_delay(100);
                push(&tr, &std::format!("remain={}", remain));
            })
        };
        assert!(taken(&tr).is_empty());

        ticks(kr, 30);
        assert!(taken(&tr).is_empty());
        kr.k().exception_post(ta, EXC_ALRM).unwrap();

        let got = taken(&tr);
        assert_eq!(got.len(), 1);
        let remain: u32 = got[0].strip_prefix("remain=").unwrap().parse().unwrap();
        assert!(remain >= 70, "remain={}", remain);
        audit(kr);
    }

    #[test]
    fn test_delay_times_out_to_zero() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let remain = kr.k().timer_delay(20);
                push(&tr, &std::format!("remain={}", remain));
            })
        };
        ticks(kr, 25);
        assert_eq!(taken(&tr), ["remain=0"]);
        audit(kr);
    }

    fn counter() -> &'static AtomicUsize {
        Box::leak(Box::new(AtomicUsize::new(0)))
    }

    fn count_fire(_k: &mut Kernel, arg: usize) {
        unsafe { &*(arg as *const AtomicUsize) }.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_callout_stop_round_trip() {
        let (kr, _m) = test_kernel();
        let k = kr.k();
        let fired = counter();
        let before = k.timer_list.len();

        let tmr = k.timers.insert(crate::timer::Timer::new());
        k.timer_callout(tmr, 50, count_fire, fired as *const _ as usize);
        assert_eq!(k.timer_list.len(), before + 1);
        k.timer_stop(tmr);
        assert_eq!(k.timer_list.len(), before);
        assert_eq!(k.timers.get(tmr).unwrap().state, TimerState::Stop);

        // never fires afterwards
        ticks(kr, 60);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callout_survives_tick_wrap() {
        let (kr, _m) = test_kernel();
        let k = kr.k();
        let fired = counter();
        k.lbolt = u32::MAX - 5;

        let tmr = k.timers.insert(crate::timer::Timer::new());
        k.timer_callout(tmr, 10, count_fire, fired as *const _ as usize);
        ticks(kr, 4);
        assert_eq!(fired.load(Ordering::SeqCst), 0, "fired before expiry");
        ticks(kr, 8);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "lost across the wrap");
        assert!(kr.k().lbolt < 10); // wrapped
    }

    #[test]
    fn test_periodic_timer_ticks_thread() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let me = k.curthread;
                k.timer_periodic(me, 10, 10).unwrap();
                for _ in 0..3 {
                    k.timer_waitperiod().unwrap();
                    push(&tr, &std::format!("tick@{}", k.lbolt));
                }
                k.timer_periodic(me, 0, 0).unwrap();
            })
        };

        ticks(kr, 35);
        assert_eq!(taken(&tr), ["tick@10", "tick@20", "tick@30"]);
        audit(kr);
    }

    #[test]
    fn test_alarm_posts_exception() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                k.exception_setup(0x5000).unwrap();
                k.timer_alarm(15);
                match k.exception_wait() {
                    Ok(excno) => push(&tr, &std::format!("exc={}", excno)),
                    Err(e) => push(&tr, &std::format!("err={}", e)),
                }
            })
        };
        assert!(taken(&tr).is_empty());
        ticks(kr, 20);
        assert_eq!(taken(&tr), [std::format!("exc={}", EXC_ALRM)]);
        audit(kr);
    }

    /// A burst of DPC requests before the DPC thread runs
    /// collapses into one callback.
    #[test]
    fn test_dpc_burst_coalesces() {
        let (kr, _m) = test_kernel();
        let k = kr.k();
        let d = k.dpc_create();
        let fired = counter();

        k.sched_lock();
        for _ in 0..100 {
            k.sched_dpc(d, count_fire, fired as *const _ as usize);
        }
        assert_eq!(k.dpcq.len(), 1);
        k.sched_unlock(); // DPC thread drains here

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(kr.k().dpcq.is_empty());
        audit(kr);
    }
}

mod vm_tests {
    use super::*;
    use crate::memory::seg::SegFlags;

    #[test]
    fn test_allocate_free_round_trip() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let k = kr.k();

        let total0 = k.vm_total(ta);
        let free0 = k.pages.free_bytes();
        let va = k.vm_allocate(ta, 0, 3 * PAGE_SIZE, true).unwrap();
        assert_eq!(k.vm_total(ta), total0 + 3 * PAGE_SIZE);
        k.vm_free(ta, va).unwrap();
        assert_eq!(k.vm_total(ta), total0);
        assert_eq!(k.pages.free_bytes(), free0);
        // double free is rejected
        assert_eq!(k.vm_free(ta, va), Err(api::Errno::EINVAL));
        audit(kr);
    }

    #[test]
    fn test_allocate_exact_placement() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let k = kr.k();

        let va = 0x0020_0000;
        let got = k.vm_allocate(ta, va, PAGE_SIZE, false).unwrap();
        assert_eq!(got, va);
        // overlapping reservation fails
        assert_eq!(
            k.vm_allocate(ta, va, PAGE_SIZE, false),
            Err(api::Errno::ENOMEM)
        );
        k.vm_free(ta, va).unwrap();
        audit(kr);
    }

    #[test]
    fn test_zero_fill_and_protection() {
        let (kr, machine) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();

        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                let va = k.vm_allocate(k.task_self(), 0, PAGE_SIZE, true).unwrap();
                let mut buf = [0xffu8; 16];
                k.machine.copyin(va, &mut buf).unwrap();
                push(&tr, &std::format!("zeroed={}", buf.iter().all(|&b| b == 0)));

                k.machine.copyout(b"abcd", va).unwrap();
                k.vm_attribute(k.task_self(), va, Prot::READ).unwrap();
                // read-only now: writes fault, reads still fine
                push(&tr, &std::format!("wr={:?}", k.machine.copyout(b"x", va)));
                let mut b = [0u8; 4];
                k.machine.copyin(va, &mut b).unwrap();
                push(&tr, &std::format!("rd={}", core::str::from_utf8(&b).unwrap()));
            })
        };
        let _ = machine;
        assert_eq!(
            taken(&tr),
            ["zeroed=true", "wr=Err(EFAULT)", "rd=abcd"]
        );
        audit(kr);
    }

    /// COPY-mode task creation. Text stays physically
    /// shared; data and bss get private copies of the parent's bytes.
    #[test]
    fn test_vm_dup_shares_text_copies_data() {
        let (kr, machine) = test_kernel();
        let parent = user_task(kr);
        let k = kr.k();

        let text = k.vm_allocate(parent, 0x0010_0000, PAGE_SIZE, false).unwrap();
        let data = k.vm_allocate(parent, 0x0020_0000, PAGE_SIZE, false).unwrap();
        let bss = k.vm_allocate(parent, 0x0030_0000, PAGE_SIZE, false).unwrap();

        machine.write_user(pgd_of(kr, parent), text, b"code");
        machine.write_user(pgd_of(kr, parent), data, b"data");
        k.vm_attribute(parent, text, Prot::READ).unwrap();

        let child = k.task_create(parent, VmInherit::Copy).unwrap();

        let (pmap, cmap) = (
            k.tasks.get(parent).unwrap().map,
            k.tasks.get(child).unwrap().map,
        );
        fn find(
            k: &Kernel,
            map: crate::memory::vm::MapId,
            va: u64,
        ) -> crate::memory::seg::Seg {
            let m = k.maps.get(map).unwrap();
            m.segs.segs[m.segs.lookup(va, 1).unwrap()].clone()
        }

        // text: same physical pages, both sides in one share group
        let (pt, ct) = (find(k, pmap, text), find(k, cmap, text));
        assert_eq!(pt.phys, ct.phys);
        assert!(pt.flags.contains(SegFlags::SHARED));
        assert!(ct.flags.contains(SegFlags::SHARED));
        assert_eq!(pt.share, ct.share);
        assert!(pt.share.is_some());

        // data/bss: fresh pages holding the parent's bytes
        let (pd, cd) = (find(k, pmap, data), find(k, cmap, data));
        assert_ne!(pd.phys, cd.phys);
        assert_eq!(machine.read_user(pgd_of(kr, child), data, 4), b"data");
        let cb = find(k, cmap, bss);
        assert_ne!(find(k, pmap, bss).phys, cb.phys);
        assert_eq!(machine.read_user(pgd_of(kr, child), bss, 4), [0; 4]);

        assert_eq!(k.vm_total(parent), k.vm_total(child));
        audit(kr);

        // writing to the child's shared text breaks the share
        k.vm_attribute(child, text, Prot::READ | Prot::WRITE).unwrap();
        let (pt, ct) = (find(k, pmap, text), find(k, cmap, text));
        assert_ne!(pt.phys, ct.phys);
        assert!(!pt.flags.contains(SegFlags::SHARED));
        assert!(!ct.flags.contains(SegFlags::SHARED));
        assert_eq!(machine.read_user(pgd_of(kr, child), text, 4), b"code");
        audit(kr);
    }

    #[test]
    fn test_vm_map_shares_with_other_task() {
        let (kr, machine) = test_kernel();
        let ta = user_task(kr);
        let tb = user_task(kr);
        let tr = trace();

        let src = kr.k().vm_allocate(ta, 0, PAGE_SIZE, true).unwrap();
        machine.write_user(pgd_of(kr, ta), src, b"shared!");

        let _t = {
            let tr = tr.clone();
            spawn(kr, tb, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                // self-mapping is rejected
                push(
                    &tr,
                    &std::format!("self={:?}", k.vm_map(k.task_self(), src, 8)),
                );
                let va = k.vm_map(ta, src, 8).unwrap();
                let mut buf = [0u8; 7];
                k.machine.copyin(va, &mut buf).unwrap();
                push(&tr, &std::format!("got={}", core::str::from_utf8(&buf).unwrap()));
            })
        };
        assert_eq!(
            taken(&tr),
            ["self=Err(EINVAL)", "got=shared!"]
        );
        audit(kr);
    }
}

mod device_tests {
    use super::*;
    use crate::device::{DevOps, Driver};
    use crate::error::{Errno, Result};
    use api::{CapSet, DeviceFlags};
    use crate::device::DeviceId;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CTL_CALLS: AtomicUsize = AtomicUsize::new(0);

    struct GoodOps;
    impl DevOps for GoodOps {
        fn devctl(&self, _k: &mut Kernel, _dev: DeviceId, _cmd: u32, _arg: usize) -> Result<()> {
            CTL_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BadOps;
    impl DevOps for BadOps {
        fn devctl(&self, _k: &mut Kernel, _dev: DeviceId, _cmd: u32, _arg: usize) -> Result<()> {
            CTL_CALLS.fetch_add(1, Ordering::SeqCst);
            Err(Errno::EBUSY)
        }
    }

    static GOOD: Driver = Driver {
        name: "good",
        devops: &GoodOps,
        devsz: 0,
    };
    static BAD: Driver = Driver {
        name: "bad",
        devops: &BadOps,
        devsz: 32,
    };

    #[test]
    fn test_broadcast_force_semantics() {
        let (kr, _m) = test_kernel();
        let k = kr.k();
        k.device_create(&GOOD, "null", DeviceFlags::CHR).unwrap();
        k.device_create(&BAD, "flaky", DeviceFlags::CHR).unwrap();

        // forced: every device is told, one failure turns into EIO
        let before = CTL_CALLS.load(Ordering::SeqCst);
        assert_eq!(k.device_broadcast(1, 0, true), Err(Errno::EIO));
        assert_eq!(CTL_CALLS.load(Ordering::SeqCst), before + 2);

        // unforced: the first failure stops the walk with its own error
        let r = k.device_broadcast(2, 0, false);
        assert_eq!(r, Err(Errno::EBUSY));
    }

    #[test]
    fn test_open_probe_and_soft_state() {
        let (kr, _m) = test_kernel();
        let k = kr.k();
        let dev = k.device_create(&BAD, "disk0", DeviceFlags::BLK).unwrap();
        assert!(!k.device_private(dev).is_null());

        // open succeeds even with default (no-op) open entry
        let got = k.device_open("disk0", 0).unwrap();
        assert_eq!(got, dev);
        k.device_close(got).unwrap();
        assert_eq!(k.device_open("nosuch", 0), Err(Errno::ENXIO));

        // default read entry reports an unsupported transfer
        let mut n = 0usize;
        assert_eq!(k.device_read(dev, 0x5000, &mut n, 0), Err(Errno::ENODEV));
    }

    #[test]
    fn test_protected_device_needs_rawio() {
        let (kr, _m) = test_kernel();
        let ta = user_task(kr);
        let tr = trace();
        let k = kr.k();
        k.device_create(&GOOD, "nvram", DeviceFlags::CHR | DeviceFlags::PROT)
            .unwrap();

        // strip RAWIO from the user task, then try to open from it
        let caps = k.tasks.get(ta).unwrap().capability - CapSet::RAWIO;
        k.task_setcap(ta, caps).unwrap();
        let _t = {
            let tr = tr.clone();
            spawn(kr, ta, 100, SchedPolicy::Fifo, true, move || {
                let k = kr.k();
                push(&tr, &std::format!("open={:?}", k.device_open("nvram", 0)));
            })
        };
        assert_eq!(taken(&tr), ["open=Err(EPERM)"]);
    }
}
