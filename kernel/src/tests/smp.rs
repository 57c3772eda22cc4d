/*
 * Multi-CPU Tests
 *
 * CPU 1 runs its idle loop on its own OS thread (`SecondaryCpu`); the test
 * body stays CPU 0's idle thread.
 */

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{SecondaryCpu, Trace, boot, leak, run_until};
use crate::arch::Arch;
use crate::arch::host::HostArch;
use crate::scheduler::{CpuId, CpuMask, Priority, ThreadBuilder, ThreadState};
use crate::sync::WaitQueue;
use crate::SchedError;

fn on_cpu() -> String {
    HostArch::current_cpu().to_string()
}

#[test]
fn pinned_thread_runs_on_its_cpu_and_costs_an_ipi() {
    let kernel = boot(2);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let seen = leak(AtomicU32::new(u32::MAX));
    let ipis_before = kernel.cpu(CpuId(1)).unwrap().ipis_received();

    let thread = ThreadBuilder::new("pinned")
        .affinity(CpuMask::single(CpuId(1)))
        .spawn(kernel, move || seen.store(HostArch::current_cpu().0, Ordering::Release))
        .unwrap();

    run_until(kernel, || seen.load(Ordering::Acquire) != u32::MAX);
    assert_eq!(seen.load(Ordering::Acquire), 1);
    assert_eq!(thread.cpu(), Some(CpuId(1)));
    assert!(kernel.cpu(CpuId(1)).unwrap().ipis_received() > ipis_before);
}

#[test]
fn new_threads_go_to_least_loaded_cpu() {
    let kernel = boot(2);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let trace = Trace::new();

    let spawn = |name: &'static str| {
        let t = trace.clone();
        ThreadBuilder::new(name)
            .suspended()
            .spawn(kernel, move || t.push(format!("{} on {}", name, on_cpu())))
            .unwrap()
    };
    let a = spawn("a");
    let b = spawn("b");

    kernel.enqueue_runnable_thread(&a).unwrap();
    assert_eq!(a.cpu(), Some(CpuId(0)));
    kernel.enqueue_runnable_thread(&b).unwrap();
    assert_eq!(b.cpu(), Some(CpuId(1)));

    run_until(kernel, || trace.len() == 2);
    let mut entries = trace.entries();
    entries.sort();
    assert_eq!(entries, ["a on CPU0", "b on CPU1"]);
}

#[test]
fn running_thread_migrates_when_affinity_excludes_its_cpu() {
    let kernel = boot(2);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let trace = Trace::new();

    let t = trace.clone();
    let wanderer = kernel
        .spawn_kernel_thread("wanderer", Priority::NORMAL, move || {
            t.push(on_cpu());
            let me = kernel.current_thread_id();
            let _ = kernel.set_affinity(me, CpuMask::single(CpuId(1)));
            kernel.preempt_point();
            t.push(on_cpu());
        })
        .unwrap();
    assert_eq!(wanderer.cpu(), Some(CpuId(0)));

    run_until(kernel, || trace.len() == 2);
    assert_eq!(trace.entries(), ["CPU0", "CPU1"]);
    assert_eq!(wanderer.affinity(), CpuMask::single(CpuId(1)));
}

#[test]
fn ready_thread_moves_queue_when_affinity_changes() {
    let kernel = boot(2);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let trace = Trace::new();

    let t = trace.clone();
    let mover = ThreadBuilder::new("mover")
        .suspended()
        .spawn(kernel, move || t.push(on_cpu()))
        .unwrap();
    kernel.enqueue_runnable_thread(&mover).unwrap();
    assert_eq!(kernel.cpu(CpuId::BSP).unwrap().ready_len(), 1);

    kernel
        .set_affinity(mover.id, CpuMask::single(CpuId(1)))
        .unwrap();
    assert_eq!(kernel.cpu(CpuId::BSP).unwrap().ready_len(), 0);
    assert_eq!(kernel.cpu(CpuId::BSP).unwrap().load(), 0);

    run_until(kernel, || trace.len() == 1);
    assert_eq!(trace.entries(), ["CPU1"]);

    assert_eq!(
        kernel.set_affinity(mover.id, CpuMask::single(CpuId(5))),
        Err(SchedError::NoOnlineCpu)
    );
}

#[test]
fn wake_from_another_cpu_reaches_pinned_waiter() {
    let kernel = boot(2);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let queue: &'static WaitQueue<HostArch> = leak(WaitQueue::fifo());
    let trace = Trace::new();

    let t = trace.clone();
    let waiter = ThreadBuilder::new("remote-waiter")
        .affinity(CpuMask::single(CpuId(1)))
        .spawn(kernel, move || {
            let result = queue.block(kernel, None);
            t.push(format!("{:?} on {}", result, on_cpu()));
        })
        .unwrap();

    run_until(kernel, || waiter.state() == ThreadState::Blocked);
    let ipis = kernel.cpu(CpuId(1)).unwrap().ipis_received();
    assert!(queue.wake_one(kernel));

    run_until(kernel, || trace.len() == 1);
    assert_eq!(trace.entries(), ["Signaled on CPU1"]);
    assert!(kernel.cpu(CpuId(1)).unwrap().ipis_received() > ipis);
}

#[test]
fn priority_and_affinity_changes_race_with_switching() {
    let kernel = boot(3);
    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    let _cpu2 = SecondaryCpu::start(kernel, CpuId(2));
    let stop = leak(AtomicBool::new(false));
    let parked: &'static WaitQueue<HostArch> = leak(WaitQueue::fifo());

    let workers: Vec<_> = ["spinner-a", "spinner-b"]
        .into_iter()
        .map(|name| {
            ThreadBuilder::new(name)
                .affinity(CpuMask::single(CpuId(1)))
                .spawn(kernel, move || {
                    while !stop.load(Ordering::Acquire) {
                        kernel.yield_now();
                    }
                    parked.block(kernel, None);
                })
                .unwrap()
        })
        .collect();

    let masks = [
        CpuMask::single(CpuId(1)),
        CpuMask::single(CpuId(2)),
        CpuMask::single(CpuId(1)).with(CpuId(2)),
    ];
    let levels = [Priority::new(30).unwrap(), Priority::new(31).unwrap()];
    for round in 0..100_000usize {
        for (i, worker) in workers.iter().enumerate() {
            kernel.set_priority(worker.id, levels[(round + i) % 2]).unwrap();
            if round % 64 == 0 {
                kernel.set_affinity(worker.id, masks[(round / 64 + i) % masks.len()]).unwrap();
            }
        }
    }

    stop.store(true, Ordering::Release);
    run_until(kernel, || parked.len() == 2);
    assert_eq!(kernel.check_invariants(), Ok(()));
    for cpu in [CpuId(1), CpuId(2)] {
        assert!(kernel.cpu(cpu).unwrap().ready_threads().is_empty());
    }

    assert_eq!(parked.wake_all(kernel), 2);
    run_until(kernel, || workers.iter().all(|w| w.state() == ThreadState::Dying));
}

#[test]
fn cpu_bring_up_is_checked() {
    let kernel = boot(2);

    // CPU 0 is already online and this thread is not CPU 1
    assert_eq!(kernel.bootstrap_cpu(CpuId::BSP).err(), Some(SchedError::InvalidState));
    assert_eq!(kernel.bootstrap_cpu(CpuId(1)).err(), Some(SchedError::InvalidState));
    assert_eq!(kernel.cpu(CpuId(7)).err().map(|e| e.to_string()), Some("CPU offline".into()));
    assert_eq!(kernel.pick_next(CpuId(1)), Err(SchedError::CpuOffline));
    assert_eq!(kernel.online_mask(), CpuMask::single(CpuId::BSP));

    let _cpu1 = SecondaryCpu::start(kernel, CpuId(1));
    assert_eq!(kernel.online_mask(), CpuMask::first_n(2));
    let idle1 = kernel.cpu(CpuId(1)).unwrap().idle_id().unwrap();
    assert_eq!(kernel.pick_next(CpuId(1)), Ok(idle1));
    assert_eq!(kernel.set_priority(idle1, Priority::HIGH), Err(SchedError::InvalidState));
}
