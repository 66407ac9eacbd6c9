// Once clippy takes `clippy.toml` into account (for `tests` targets),
// we can remove these.
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

mod common;

use domdbg_core::Error;
use domdbg_core::control::{Debugger, RunState};
use domdbg_core::domain::WordSize;
use test_log::test;
use tokio_util::sync::CancellationToken;

use crate::common::MockDomain;

#[test]
fn round_trip_patch() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0x48, 0x89]);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    let id = dbg.create_breakpoint(0x1000).unwrap();
    assert_eq!(id, 0);
    assert_eq!(dom.read(0x1000, 2), [0xeb, 0xfe]);
    assert_eq!(dbg.read_memory_masking(0x1000, 2).unwrap(), [0x48, 0x89]);

    dbg.delete_breakpoint(id).unwrap();
    assert_eq!(dom.read(0x1000, 2), [0x48, 0x89]);
    assert!(dbg.breakpoints().unwrap().is_empty());
}

#[test]
fn duplicate_create_reuses_entry() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0x48, 0x89]);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    let first = dbg.create_breakpoint(0x1000).unwrap();
    let second = dbg.create_breakpoint(0x1000).unwrap();
    assert_eq!(first, second);
    assert_eq!(dbg.breakpoints().unwrap().len(), 1);

    // a double-save of the original bytes would restore the trap word here
    dbg.delete_breakpoint(first).unwrap();
    assert_eq!(dom.read(0x1000, 2), [0x48, 0x89]);
}

#[test]
fn breakpoint_ids_are_monotonic() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);

    let mut dbg = Debugger::new(dom);
    dbg.attach().unwrap();

    assert_eq!(dbg.create_breakpoint(0x1000).unwrap(), 0);
    assert_eq!(dbg.create_breakpoint(0x1010).unwrap(), 1);

    dbg.delete_breakpoint(0).unwrap();

    // ids are never reused within an attachment
    assert_eq!(dbg.create_breakpoint(0x1020).unwrap(), 2);
}

#[test]
fn delete_unknown_breakpoint_fails() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);

    let mut dbg = Debugger::new(dom);
    dbg.attach().unwrap();

    assert!(matches!(
        dbg.delete_breakpoint(42),
        Err(Error::NoSuchBreakpoint(42))
    ));
}

#[test]
fn operations_require_attachment() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);

    let mut dbg = Debugger::new(dom);

    assert!(matches!(
        dbg.create_breakpoint(0x1000),
        Err(Error::NotAttached)
    ));
    assert!(matches!(
        dbg.read_memory_masking(0x1000, 2),
        Err(Error::NotAttached)
    ));
    assert!(matches!(dbg.check_breakpoint_hit(), Err(Error::NotAttached)));
    assert!(matches!(dbg.get_var("x"), Err(Error::NotAttached)));
}

#[test(tokio::test)]
async fn step_across_unconditional_jump() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    // jmp +5, landing at 0x1007
    dom.load(0x1000, &[0xeb, 0x05]);
    dom.queue_stop(0x1007);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    let cancel = CancellationToken::new();
    let hit = dbg.single_step(&cancel).await.unwrap();

    assert_eq!(hit, 0x1007);
    assert!(dbg.breakpoints().unwrap().is_empty());
    assert_eq!(dom.read(0x1002, 2), [0x00, 0x00]);
    assert_eq!(dom.read(0x1007, 2), [0x00, 0x00]);
    assert_eq!(dbg.run_state(), Some(RunState::Paused));
    assert!(dom.is_paused());
}

#[test(tokio::test)]
async fn step_through_user_breakpoint() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0xeb, 0x05]);
    dom.queue_stop(0x1007);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();
    dbg.create_breakpoint(0x1000).unwrap();

    let before = dbg.breakpoints().unwrap();

    let cancel = CancellationToken::new();
    let hit = dbg.single_step(&cancel).await.unwrap();
    assert_eq!(hit, 0x1007);

    // no transient residue, the user breakpoint is back in place
    assert_eq!(dbg.breakpoints().unwrap(), before);
    assert_eq!(dom.read(0x1000, 2), [0xeb, 0xfe]);
    assert_eq!(dom.read(0x1002, 2), [0x00, 0x00]);
    assert_eq!(dom.read(0x1007, 2), [0x00, 0x00]);
}

#[test(tokio::test)]
async fn step_keeps_user_breakpoint_at_target() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0xeb, 0x05]);
    dom.queue_stop(0x1007);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();
    let id = dbg.create_breakpoint(0x1007).unwrap();

    let cancel = CancellationToken::new();
    let hit = dbg.single_step(&cancel).await.unwrap();
    assert_eq!(hit, 0x1007);

    // the stop landed on a user breakpoint, which must survive the step
    let table = dbg.breakpoints().unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].id, id);
    assert_eq!(dom.read(0x1007, 2), [0xeb, 0xfe]);
    assert_eq!(dom.read(0x1002, 2), [0x00, 0x00]);
}

#[test(tokio::test)]
async fn failed_prediction_leaves_state_intact() {
    // region too small for the 32-byte decode window at the step address
    let dom = MockDomain::new(0x1000, 0x20, WordSize::Eight);
    dom.set_ip(0x1010);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();
    dbg.create_breakpoint(0x1010).unwrap();

    let cancel = CancellationToken::new();
    let res = dbg.single_step(&cancel).await;
    assert!(matches!(res, Err(Error::Domain(_))));

    // the lifted breakpoint was replanted and the guest stays paused
    assert_eq!(dbg.breakpoints().unwrap().len(), 1);
    assert_eq!(dom.read(0x1010, 2), [0xeb, 0xfe]);
    assert!(dom.is_paused());
    assert_eq!(dbg.run_state(), Some(RunState::Paused));
}

#[test(tokio::test)]
async fn cancelled_step_cleans_up() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0xeb, 0x05]);
    // no stop queued: the guest never reaches a successor

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let res = dbg.single_step(&cancel).await;
    assert!(matches!(res, Err(Error::Cancelled)));

    assert!(dbg.breakpoints().unwrap().is_empty());
    assert_eq!(dom.read(0x1002, 2), [0x00, 0x00]);
    assert_eq!(dom.read(0x1007, 2), [0x00, 0x00]);
    assert!(dom.is_paused());
}

#[test(tokio::test)]
async fn resume_steps_over_current_breakpoint() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0xeb, 0x05]);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();
    dbg.create_breakpoint(0x1000).unwrap();

    // the step lands at 0x1007; the guest then loops back into the trap
    dom.queue_stop(0x1007);
    dom.queue_stop(0x1000);

    let cancel = CancellationToken::new();
    dbg.resume_guest(&cancel).await.unwrap();
    assert_eq!(dbg.run_state(), Some(RunState::Running));

    let hit = dbg.wait_for_stop(&cancel).await.unwrap();
    assert_eq!(hit, 0x1000);
    assert!(dom.is_paused());
    assert_eq!(dom.read(0x1000, 2), [0xeb, 0xfe]);
}

#[test(tokio::test)]
async fn cancelled_wait_pauses_guest() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0x90, 0x90]);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    let cancel = CancellationToken::new();
    dbg.resume_guest(&cancel).await.unwrap();

    cancel.cancel();
    let res = dbg.wait_for_stop(&cancel).await;
    assert!(matches!(res, Err(Error::Cancelled)));
    assert!(dom.is_paused());
    assert_eq!(dbg.run_state(), Some(RunState::Paused));
}

#[test]
fn overwrite_preserves_breakpoints() {
    let dom = MockDomain::new(0x2000, 0x100, WordSize::Eight);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    dbg.create_breakpoint(0x2000).unwrap();
    dbg.create_breakpoint(0x2004).unwrap();

    dbg.write_memory_retaining(0x2000, &[0xff; 6]).unwrap();

    assert_eq!(
        dom.read(0x2000, 6),
        [0xeb, 0xfe, 0xff, 0xff, 0xeb, 0xfe]
    );
    assert_eq!(dbg.breakpoints().unwrap().len(), 2);
    assert_eq!(dbg.read_memory_masking(0x2000, 6).unwrap(), [0xff; 6]);
}

#[test]
fn overwrite_preserves_breakpoint_at_range_edge() {
    let dom = MockDomain::new(0x2000, 0x100, WordSize::Eight);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();

    // trap word at 0x2003..0x2005 half-overlaps the written range
    dbg.create_breakpoint(0x2003).unwrap();

    dbg.write_memory_retaining(0x2000, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();

    assert_eq!(dom.read(0x2000, 3), [0xaa, 0xbb, 0xcc]);
    assert_eq!(dom.read(0x2003, 2), [0xeb, 0xfe]);
    assert_eq!(dbg.breakpoints().unwrap().len(), 1);

    // the masked view reports the caller's bytes
    assert_eq!(
        dbg.read_memory_masking(0x2000, 4).unwrap(),
        [0xaa, 0xbb, 0xcc, 0xdd]
    );
}

#[test]
fn masking_covers_partial_overlaps() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();
    dbg.create_breakpoint(0x1001).unwrap();

    assert_eq!(dom.read(0x1001, 2), [0xeb, 0xfe]);

    // full overlap
    assert_eq!(
        dbg.read_memory_masking(0x1000, 4).unwrap(),
        [0x11, 0x22, 0x33, 0x44]
    );

    // trap straddles the end of the range
    assert_eq!(dbg.read_memory_masking(0x1000, 2).unwrap(), [0x11, 0x22]);

    // trap straddles the start of the range
    assert_eq!(dbg.read_memory_masking(0x1002, 2).unwrap(), [0x33, 0x44]);
}

#[test]
fn variables_live_and_die_with_attachment() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);

    let mut dbg = Debugger::new(dom);
    dbg.attach().unwrap();

    dbg.set_var("entry", 0x1000).unwrap();
    assert_eq!(dbg.get_var("entry").unwrap(), 0x1000);

    dbg.set_var("entry", 0x2000).unwrap();
    assert_eq!(dbg.get_var("entry").unwrap(), 0x2000);

    dbg.delete_var("entry").unwrap();
    assert!(matches!(
        dbg.get_var("entry"),
        Err(Error::NoSuchVariable(_))
    ));
    assert!(matches!(
        dbg.delete_var("entry"),
        Err(Error::NoSuchVariable(_))
    ));

    dbg.set_var("entry", 1).unwrap();
    dbg.detach().unwrap();
    dbg.attach().unwrap();

    assert!(matches!(
        dbg.get_var("entry"),
        Err(Error::NoSuchVariable(_))
    ));
}

#[test]
fn detach_restores_all_patches() {
    let dom = MockDomain::new(0x1000, 0x100, WordSize::Eight);
    dom.load(0x1000, &[0x11, 0x22]);
    dom.load(0x1010, &[0x33, 0x44]);

    let mut dbg = Debugger::new(dom.clone());
    dbg.attach().unwrap();
    dbg.create_breakpoint(0x1000).unwrap();
    dbg.create_breakpoint(0x1010).unwrap();

    dbg.detach().unwrap();

    assert_eq!(dom.read(0x1000, 2), [0x11, 0x22]);
    assert_eq!(dom.read(0x1010, 2), [0x33, 0x44]);
    assert!(!dbg.is_attached());
}
