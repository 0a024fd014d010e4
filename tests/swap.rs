mod common;

use common::*;
use swapboot::boot::BootError;
use swapboot::hardware::{Config, CorruptLedgerPolicy};
use swapboot::manager::{MarkError, UpdateManager};
use swapboot::state::ledger::{Ledger, LedgerState};
use swapboot::state::trailer::Trailer;
use swapboot::state::{Flag, Step, SwapHalf, SwapType};

// Flash operations of a swap-move on MemFlash with a 256 byte scratch buffer: the ledger is
// opened with one erase and three field writes, then the secondary trailer is erased. Each
// sector step is an erase, four chunk writes and a ledger entry.
const PREAMBLE_OPS: usize = 5;
const STEP_OPS: usize = 6;

struct Staged {
    flash: MemFlash,
    old: Vec<u8>,
    new: Vec<u8>,
    keys: TestKeys,
}

fn stage(old_len: usize, new_len: usize, permanent: bool) -> Staged {
    let key = signing_key(1);
    let old = ImageBuilder::new(body(old_len, 1)).version(1, 0).build(&key);
    let new = ImageBuilder::new(body(new_len, 2)).version(2, 0).build(&key);
    let mut flash = flash();
    flash.load(&primary(), &old);
    flash.load(&secondary(), &new);
    let mut manager = UpdateManager::new(config(), flash).unwrap();
    manager.request_upgrade(permanent).unwrap();
    Staged {
        flash: manager.destroy(),
        old,
        new,
        keys: TestKeys::of(&[&key]),
    }
}

/// Two images of eight sectors each, the new one queued for test.
fn staged() -> Staged {
    stage(7000, 7100, false)
}

fn ledger() -> Ledger {
    Ledger::new::<MemFlash>(&config())
}

fn holds(flash: &MemFlash, area: &swapboot::hardware::FlashArea, image: &[u8]) -> bool {
    &flash.area(area)[..image.len()] == image
}

#[test]
fn test_swap_exchanges_the_slots() {
    let staged = staged();
    let mut boot = bootloader(config(), staged.flash, staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Test);
    assert_eq!(response.header.version.major, 2);
    assert_eq!(response.key, Some(0));

    let (mut flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.new));
    assert!(holds(&flash, &secondary(), &staged.old));
    assert_eq!(ledger().read(&mut flash).unwrap(), LedgerState::Empty);
    let pri = ledger().primary().read_state(&mut flash).unwrap();
    assert_eq!(pri.copy_done, Flag::Set);
    assert_eq!(pri.image_ok, Flag::Unset);
}

#[test]
fn unconfirmed_test_reverts() {
    let staged = staged();
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    boot.prepare().unwrap();
    let (flash, ..) = boot.destroy();

    let mut boot = bootloader(config(), flash, staged.keys.clone());
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Revert);
    assert_eq!(response.header.version.major, 1);
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.old));
    assert!(holds(&flash, &secondary(), &staged.new));

    // the reverted image stays put
    let mut boot = bootloader(config(), flash, staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::None);
    assert_eq!(response.header.version.major, 1);
}

#[test]
fn confirmed_test_stays() {
    let staged = staged();
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    boot.prepare().unwrap();
    let (flash, ..) = boot.destroy();

    let mut manager = UpdateManager::new(config(), flash).unwrap();
    assert_eq!(manager.swap_type().unwrap(), SwapType::Revert);
    manager.mark_boot_successful().unwrap();
    assert_eq!(manager.swap_type().unwrap(), SwapType::None);
    // confirming twice is harmless
    manager.mark_boot_successful().unwrap();

    let mut boot = bootloader(config(), manager.destroy(), staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::None);
    assert_eq!(response.header.version.major, 2);
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.new));
}

#[test]
fn permanent_upgrade_is_confirmed() {
    let staged = stage(7000, 7100, true);
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    assert_eq!(boot.prepare().unwrap().swap_type, SwapType::Perm);
    let (mut flash, ..) = boot.destroy();
    assert_eq!(
        ledger().primary().read_image_ok(&mut flash).unwrap(),
        Flag::Set
    );

    let mut boot = bootloader(config(), flash, staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::None);
    assert_eq!(response.header.version.major, 2);
}

#[test]
fn confirm_with_pending_upgrade() {
    let staged = staged();
    let mut manager = UpdateManager::new(config(), staged.flash).unwrap();
    assert_eq!(manager.swap_type().unwrap(), SwapType::Test);
    assert_eq!(
        manager.mark_boot_successful(),
        Err(MarkError::UpdateQueuedButNotInstalled)
    );
}

#[test]
fn resumes_after_power_loss_during_moves() {
    let mut staged = staged();
    staged.flash.cut_power_after(PREAMBLE_OPS + 3 * STEP_OPS);
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    assert!(matches!(boot.prepare(), Err(BootError::Flash(_))));
    let (mut flash, ..) = boot.destroy();
    flash.restore_power();

    match ledger().read(&mut flash).unwrap() {
        LedgerState::InProgress(status) => {
            assert_eq!(status.step, Step::Move { idx: 3 });
            assert_eq!(status.swap_type, SwapType::Test);
        }
        other => panic!("expected an interrupted swap, got {:?}", other),
    }

    let mut manager = UpdateManager::new(config(), flash).unwrap();
    assert_eq!(manager.swap_type().unwrap(), SwapType::Test);

    let mut boot = bootloader(config(), manager.destroy(), staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Test);
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.new));
    assert!(holds(&flash, &secondary(), &staged.old));
}

/// Runs one boot from `start` without interruption, then once per flash operation with
/// power cut before it. Each interrupted boot is followed by a clean one, which has to
/// report `expected` and leave the flash exactly like the uninterrupted run.
fn converges_after_any_power_loss(
    start: &MemFlash,
    keys: &TestKeys,
    config: Config,
    expected: SwapType,
) {
    let mut reference = bootloader(config, start.clone(), keys.clone());
    assert_eq!(reference.prepare().unwrap().swap_type, expected);
    let (reference, ..) = reference.destroy();
    let total = reference.ops - start.ops;
    assert!(total > PREAMBLE_OPS + 16 * STEP_OPS);

    for cut in 0..total {
        let mut flash = start.clone();
        flash.cut_power_after(cut);
        let mut boot = bootloader(config, flash, keys.clone());
        assert!(boot.prepare().is_err(), "power cut after {} ops", cut);
        let (mut flash, ..) = boot.destroy();
        flash.restore_power();

        let mut boot = bootloader(config, flash, keys.clone());
        let response = boot.prepare().unwrap();
        assert_eq!(response.swap_type, expected, "power cut after {} ops", cut);
        let (flash, ..) = boot.destroy();
        assert!(
            flash.mem == reference.mem,
            "flash differs after power cut after {} ops",
            cut
        );
    }
}

/// The slots after a completed, unconfirmed test swap.
fn tested() -> Staged {
    let staged = staged();
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    boot.prepare().unwrap();
    let (flash, ..) = boot.destroy();
    Staged { flash, ..staged }
}

#[test]
fn any_single_power_loss_converges() {
    let staged = staged();
    converges_after_any_power_loss(&staged.flash, &staged.keys, config(), SwapType::Test);
}

#[test]
fn any_single_power_loss_during_permanent_upgrade_converges() {
    let staged = stage(7000, 7100, true);
    converges_after_any_power_loss(&staged.flash, &staged.keys, config(), SwapType::Perm);
}

#[test]
fn any_single_power_loss_during_revert_converges() {
    let tested = tested();
    converges_after_any_power_loss(&tested.flash, &tested.keys, config(), SwapType::Revert);

    let mut config = config();
    config.downgrade_prevention = true;
    converges_after_any_power_loss(&tested.flash, &tested.keys, config, SwapType::Revert);
}

#[test]
fn revert_interrupted_before_its_ledger_opens() {
    let tested = tested();
    let mut config = config();
    config.downgrade_prevention = true;

    // the secondary trailer is rewritten in five operations, the primary trailer erase fails
    let mut flash = tested.flash.clone();
    flash.cut_power_after(5);
    let mut boot = bootloader(config, flash, tested.keys.clone());
    assert!(boot.prepare().is_err());
    let (mut flash, ..) = boot.destroy();
    flash.restore_power();

    let sec = ledger().secondary().read_state(&mut flash).unwrap();
    assert_eq!(sec.image_ok, Flag::Set);
    assert_eq!(sec.swap_type, SwapType::Revert);
    assert_eq!(ledger().read(&mut flash).unwrap(), LedgerState::Empty);

    let mut manager = UpdateManager::new(config, flash).unwrap();
    assert_eq!(manager.swap_type().unwrap(), SwapType::Revert);

    let mut boot = bootloader(config, manager.destroy(), tested.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Revert);
    assert_eq!(response.header.version.major, 1);
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &tested.old));
    assert!(holds(&flash, &secondary(), &tested.new));
}

#[test]
fn power_loss_during_swap_phase() {
    let mut staged = staged();
    // all eight moves, then both halves of pair 0 and the first half of pair 1
    staged.flash.cut_power_after(PREAMBLE_OPS + 11 * STEP_OPS);
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    assert!(boot.prepare().is_err());
    let (mut flash, ..) = boot.destroy();
    flash.restore_power();

    match ledger().read(&mut flash).unwrap() {
        LedgerState::InProgress(status) => assert_eq!(
            status.step,
            Step::Swap {
                idx: 1,
                half: SwapHalf::ToSecondary
            }
        ),
        other => panic!("expected an interrupted swap, got {:?}", other),
    }

    let mut boot = bootloader(config(), flash, staged.keys);
    boot.prepare().unwrap();
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.new));
    assert!(holds(&flash, &secondary(), &staged.old));
}

#[test]
fn image_too_large_for_swap_is_left_alone() {
    // eleven sectors reach into the sector holding the primary trailer
    let staged = stage(7000, 10_500, false);
    let before = staged.flash.clone();
    let mut boot = bootloader(config(), staged.flash, staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::None);
    assert_eq!(response.header.version.major, 1);
    let (flash, ..) = boot.destroy();
    assert_eq!(flash.ops, before.ops);
    assert!(flash.mem == before.mem);
}

#[test]
fn invalid_candidate_fails_without_writes() {
    let mut staged = staged();
    let sec = secondary().offset as usize;
    staged.flash.mem[sec + 0x100] ^= 0xff;
    let before = staged.flash.clone();

    let mut boot = bootloader(config(), staged.flash, staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Fail);
    assert_eq!(response.header.version.major, 1);
    let (flash, ..) = boot.destroy();
    assert_eq!(flash.ops, before.ops);
    assert!(flash.mem == before.mem);
}

#[test]
fn downgrade_is_refused() {
    let key = signing_key(1);
    let old = ImageBuilder::new(body(3000, 1)).version(3, 1).build(&key);
    let new = ImageBuilder::new(body(3000, 2)).version(3, 0).build(&key);
    let mut flash = flash();
    flash.load(&primary(), &old);
    flash.load(&secondary(), &new);
    let mut manager = UpdateManager::new(config(), flash).unwrap();
    manager.request_upgrade(true).unwrap();

    let mut config = config();
    config.downgrade_prevention = true;
    let mut boot = bootloader(config, manager.destroy(), TestKeys::of(&[&key]));
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Fail);
    assert_eq!(response.header.version.minor, 1);
}

#[test]
fn invalid_primary_does_not_boot() {
    let key = signing_key(1);
    let mut image = ImageBuilder::new(body(3000, 1)).build(&key);
    image[0x80] ^= 1;
    let mut flash = flash();
    flash.load(&primary(), &image);
    let mut boot = bootloader(config(), flash, TestKeys::of(&[&key]));
    assert_eq!(boot.prepare(), Err(BootError::InvalidImage));
}

#[test]
fn empty_primary_does_not_boot() {
    let mut boot = bootloader(config(), flash(), TestKeys::of(&[&signing_key(1)]));
    assert_eq!(boot.prepare(), Err(BootError::NoBootableImage));
}

/// Interrupts a test swap in its swap phase and erases one of the move entries, leaving two
/// gaps in the ledger.
fn corrupt_ledger() -> Staged {
    let mut staged = staged();
    staged.flash.cut_power_after(PREAMBLE_OPS + 10 * STEP_OPS);
    let mut boot = bootloader(config(), staged.flash, staged.keys.clone());
    assert!(boot.prepare().is_err());
    let (mut flash, ..) = boot.destroy();
    flash.restore_power();

    let trailer = Trailer::new::<MemFlash>(primary(), MAX_SECTORS);
    let off = (primary().offset + trailer.status_entry_off(3)) as usize;
    let len = trailer.write_size() as usize;
    flash.mem[off..off + len].fill(0xff);
    staged.flash = flash;
    staged
}

#[test]
fn corrupt_ledger_halts() {
    let staged = corrupt_ledger();
    let mut flash = staged.flash.clone();
    assert!(matches!(
        ledger().read(&mut flash).unwrap(),
        LedgerState::Corrupt(_)
    ));

    let mut config = config();
    config.corrupt_ledger_policy = CorruptLedgerPolicy::Halt;
    let before = staged.flash.clone();
    let mut boot = bootloader(config, staged.flash, staged.keys);
    assert_eq!(boot.prepare(), Err(BootError::CorruptLedger));
    let (flash, ..) = boot.destroy();
    assert_eq!(flash.ops, before.ops);
    assert!(flash.mem == before.mem);
}

#[test]
fn corrupt_ledger_resumes_and_revalidates() {
    let staged = corrupt_ledger();
    let mut config = config();
    config.corrupt_ledger_policy = CorruptLedgerPolicy::Revalidate;
    config.validate_primary_slot = false;
    let mut boot = bootloader(config, staged.flash, staged.keys);
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Test);
    assert_eq!(response.key, Some(0));
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.new));
    assert!(holds(&flash, &secondary(), &staged.old));
}

#[test]
fn overwrite_mode_copies_without_revert() {
    let staged = stage(7000, 7100, false);
    let mut config = config();
    config.upgrade_mode = swapboot::hardware::UpgradeMode::Overwrite;
    let mut boot = bootloader(config, staged.flash, staged.keys.clone());
    let response = boot.prepare().unwrap();
    assert_eq!(response.swap_type, SwapType::Test);
    assert_eq!(response.header.version.major, 2);
    let (flash, ..) = boot.destroy();
    assert!(holds(&flash, &primary(), &staged.new));
    assert!(flash.area(&secondary()).iter().all(|b| *b == 0xff));

    let mut boot = bootloader(config, flash, staged.keys);
    assert_eq!(boot.prepare().unwrap().swap_type, SwapType::None);
}
