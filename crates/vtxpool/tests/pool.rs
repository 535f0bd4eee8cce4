//! End-to-end pool behavior over the simulated session layer.
//!
//! Every test works in its own namespace and device directory, so runs are
//! hermetic and can execute in parallel.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use similar_asserts::assert_eq;
use tempfile::TempDir;

use vtxpool::alloc::{AllocRequest, Allocator};
use vtxpool::enumerate::EnumerateOptions;
use vtxpool::monitor;
use vtxpool::registrar::Registrar;
use vtxpool::registry::DevicePool;
use vtxpool::session::sim::{SimDevice, SimInstance, SimSession};
use vtxpool::shm::Namespace;
use vtxpool::types::{AllocRule, Codec, DeviceType, MAX_DEVICES};
use vtxpool::PoolError;

struct TestPool {
    ns: Namespace,
    sim: SimSession,
    opts: EnumerateOptions,
    dir: TempDir,
}

impl TestPool {
    fn new(test: &str, cards: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimSession::default();
        for i in 0..cards {
            let path = dir.path().join(format!("nvme{i}"));
            std::fs::File::create(&path).unwrap();
            sim.insert_device(SimDevice::new(path));
        }
        TestPool {
            ns: Namespace::new(format!("vtxtest_pool_{test}_{}", std::process::id())),
            sim,
            opts: EnumerateOptions {
                dev_dir: dir.path().to_path_buf(),
                prefix: "nvme".to_string(),
                max_devices: MAX_DEVICES,
            },
            dir,
        }
    }

    fn registrar(&self) -> Registrar<'_> {
        Registrar::new(self.ns.clone(), &self.sim, self.opts.clone())
    }

    fn allocator(&self) -> Allocator<'_> {
        Allocator::new(self.ns.clone(), &self.sim)
    }

    fn card_path(&self, i: usize) -> PathBuf {
        self.dir.path().join(format!("nvme{i}"))
    }

    fn add_card(&self, i: usize) -> PathBuf {
        let path = self.card_path(i);
        std::fs::File::create(&path).unwrap();
        self.sim.insert_device(SimDevice::new(path.clone()));
        path
    }

    fn unplug_card(&self, i: usize) {
        let path = self.card_path(i);
        std::fs::remove_file(&path).unwrap();
        self.sim.remove_device(&path);
    }

    fn guids(&self, device_type: DeviceType) -> Vec<i32> {
        monitor::list_devices(&self.ns, device_type)
            .unwrap()
            .iter()
            .map(|d| d.guid)
            .collect()
    }

    fn teardown(self) {
        let _ = self.registrar().remove_all();
    }
}

fn hd30() -> AllocRequest {
    AllocRequest {
        codec: Codec::H264,
        width: 1920,
        height: 1080,
        fps: 30,
    }
}

fn full_reference() -> AllocRequest {
    AllocRequest {
        codec: Codec::H264,
        width: 1920,
        height: 1080,
        fps: 240,
    }
}

fn init(pool: &TestPool) {
    pool.registrar()
        .init(true, Duration::from_secs(5))
        .unwrap();
}

#[test_log::test]
fn init_registers_cards_in_lock_step() {
    let pool = TestPool::new("init", 3);
    init(&pool);

    assert_eq!(pool.guids(DeviceType::Decoder), vec![0, 1, 2]);
    assert_eq!(pool.guids(DeviceType::Encoder), vec![0, 1, 2]);

    let err = pool.registrar().init(true, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, PoolError::AlreadyInitialized));

    pool.teardown();
}

#[test_log::test]
fn init_times_out_without_devices() {
    let pool = TestPool::new("timeout", 0);
    let start = Instant::now();
    let err = pool
        .registrar()
        .init(true, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(!DevicePool::exists(&pool.ns));
}

#[test_log::test]
fn freed_guid_is_reassigned_to_next_card() {
    let pool = TestPool::new("guidreuse", 3);
    init(&pool);

    pool.registrar().remove_device(&pool.card_path(1)).unwrap();
    assert_eq!(pool.guids(DeviceType::Decoder), vec![0, 2]);
    assert_eq!(pool.guids(DeviceType::Encoder), vec![0, 2]);

    let path = pool.add_card(3);
    let guid = pool.registrar().add_device(&path, true).unwrap();
    assert_eq!(guid, 1);
    assert_eq!(pool.guids(DeviceType::Decoder), vec![0, 2, 1]);

    pool.teardown();
}

#[test_log::test]
fn refresh_is_idempotent_and_follows_hotplug() {
    let pool = TestPool::new("refresh", 2);
    init(&pool);

    let noop = pool.registrar().refresh(true).unwrap();
    assert!(noop.is_noop());

    let added_path = pool.add_card(2);
    let summary = pool.registrar().refresh(true).unwrap();
    assert_eq!(summary.added, vec![added_path]);
    assert!(summary.removed.is_empty());

    pool.unplug_card(0);
    let summary = pool.registrar().refresh(true).unwrap();
    assert_eq!(summary.removed, vec![pool.card_path(0)]);
    assert_eq!(pool.guids(DeviceType::Decoder), vec![1, 2]);

    // And stable again.
    assert!(pool.registrar().refresh(true).unwrap().is_noop());

    pool.teardown();
}

#[test_log::test]
fn busy_card_removal_is_deferred() {
    let pool = TestPool::new("busy", 1);
    init(&pool);

    let path = pool.card_path(0);
    pool.sim.push_instance(
        &path,
        SimInstance {
            id: 0,
            device_type: DeviceType::Encoder,
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            fps: 30,
        },
    );

    let err = pool.registrar().remove_device(&path).unwrap_err();
    assert!(matches!(err, PoolError::DeviceBusy { .. }));

    // Vanished from the bus but still streaming: refresh defers removal.
    std::fs::remove_file(&path).unwrap();
    let summary = pool.registrar().refresh(true).unwrap();
    assert_eq!(summary.deferred, vec![path.clone()]);
    assert_eq!(pool.guids(DeviceType::Decoder), vec![0]);

    pool.sim.clear_instances(&path);
    pool.sim.remove_device(&path);
    let summary = pool.registrar().refresh(true).unwrap();
    assert_eq!(summary.removed, vec![path]);
    assert!(pool.guids(DeviceType::Decoder).is_empty());

    pool.teardown();
}

#[test_log::test]
fn least_load_picks_the_lighter_encoder() {
    let pool = TestPool::new("leastload", 2);
    init(&pool);

    pool.sim.set_encoder_model_load(&pool.card_path(0), 10);
    pool.sim.set_encoder_model_load(&pool.card_path(1), 40);

    let alloc = pool
        .allocator()
        .allocate_auto(DeviceType::Encoder, AllocRule::LeastLoad, hd30())
        .unwrap();
    assert_eq!(alloc.context.guid(), 0);

    // The scan refreshed the shared records from the live queries.
    let encoders = monitor::list_devices(&pool.ns, DeviceType::Encoder).unwrap();
    assert_eq!(encoders[0].model_load, 10);
    assert_eq!(encoders[1].model_load, 40);

    pool.teardown();
}

#[test_log::test]
fn least_instances_counts_live_sessions() {
    let pool = TestPool::new("leastinst", 2);
    init(&pool);

    pool.sim.push_instance(
        &pool.card_path(0),
        SimInstance {
            id: 0,
            device_type: DeviceType::Decoder,
            codec: Codec::H264,
            width: 1280,
            height: 720,
            fps: 30,
        },
    );

    let alloc = pool
        .allocator()
        .allocate_auto(DeviceType::Decoder, AllocRule::LeastInstances, hd30())
        .unwrap();
    assert_eq!(alloc.context.guid(), 1);
    assert_eq!(alloc.load, 0);

    pool.teardown();
}

#[test_log::test]
fn encoder_capacity_is_admitted_and_released() {
    let pool = TestPool::new("capacity", 1);
    init(&pool);
    let allocator = pool.allocator();

    let alloc = allocator
        .allocate_auto(DeviceType::Encoder, AllocRule::LeastLoad, full_reference())
        .unwrap();
    assert_eq!(alloc.load, full_reference().pixel_rate());

    let err = allocator
        .allocate_auto(DeviceType::Encoder, AllocRule::LeastLoad, hd30())
        .unwrap_err();
    assert!(matches!(err, PoolError::CapacityExceeded { .. }));

    allocator.release(&alloc.context, alloc.load).unwrap();
    assert!(allocator
        .allocate_auto(DeviceType::Encoder, AllocRule::LeastLoad, hd30())
        .is_ok());

    pool.teardown();
}

#[test_log::test]
fn release_restores_prior_load_exactly() {
    let pool = TestPool::new("roundtrip", 1);
    init(&pool);
    let allocator = pool.allocator();

    let first = allocator
        .allocate_direct(DeviceType::Encoder, 0, hd30())
        .unwrap();
    let prior = first.context.snapshot().unwrap().xcode_load_pixel;
    assert_eq!(prior, hd30().pixel_rate());

    let second = allocator
        .allocate_direct(
            DeviceType::Encoder,
            0,
            AllocRequest {
                codec: Codec::H265,
                width: 1280,
                height: 720,
                fps: 60,
            },
        )
        .unwrap();
    allocator.release(&second.context, second.load).unwrap();
    // Admit-then-release must land back on the prior value, byte for byte.
    assert_eq!(first.context.snapshot().unwrap().xcode_load_pixel, prior);

    allocator.release(&first.context, first.load).unwrap();
    assert_eq!(first.context.snapshot().unwrap().xcode_load_pixel, 0);

    pool.teardown();
}

#[test_log::test]
fn readding_a_card_matches_on_path_and_hw_id() {
    let pool = TestPool::new("rekey", 1);
    init(&pool);
    let path = pool.card_path(0);

    // Same path, same engines: records are refreshed in place.
    assert_eq!(pool.registrar().add_device(&path, true).unwrap(), 0);
    assert_eq!(pool.guids(DeviceType::Decoder), vec![0]);

    // Same path but the engines now report different hardware ids, as a
    // swapped card in the same slot would. That is a new registration.
    pool.sim.set_hw_id_base(&path, 4);
    assert_eq!(pool.registrar().add_device(&path, true).unwrap(), 1);
    assert_eq!(pool.guids(DeviceType::Decoder), vec![0, 1]);

    pool.teardown();
}

#[test_log::test]
fn best_available_does_not_admit_load() {
    let pool = TestPool::new("available", 1);
    init(&pool);
    let allocator = pool.allocator();

    assert_eq!(
        allocator
            .best_available(DeviceType::Encoder, hd30())
            .unwrap(),
        0
    );
    let encoders = monitor::list_devices(&pool.ns, DeviceType::Encoder).unwrap();
    assert_eq!(encoders[0].xcode_load_pixel, 0);

    let alloc = allocator
        .allocate_direct(DeviceType::Encoder, 0, full_reference())
        .unwrap();
    let err = allocator
        .best_available(DeviceType::Encoder, hd30())
        .unwrap_err();
    assert!(matches!(err, PoolError::NoDeviceAvailable { .. }));
    drop(alloc);

    pool.teardown();
}

#[test_log::test]
fn rotation_spreads_ties_across_encoders() {
    let pool = TestPool::new("rotate", 2);
    init(&pool);
    let allocator = pool.allocator().with_rotation(true);

    let first = allocator
        .allocate_auto(DeviceType::Encoder, AllocRule::LeastLoad, hd30())
        .unwrap();
    let second = allocator
        .allocate_auto(DeviceType::Encoder, AllocRule::LeastLoad, hd30())
        .unwrap();
    assert_eq!(first.context.guid(), 0);
    assert_eq!(second.context.guid(), 1);

    pool.teardown();
}

#[test_log::test]
fn concurrent_direct_allocations_never_lose_updates() {
    let pool = TestPool::new("concurrent", 1);
    init(&pool);

    const THREADS: usize = 8;
    const ROUNDS: usize = 25;
    let tiny = AllocRequest {
        codec: Codec::H264,
        width: 64,
        height: 64,
        fps: 1,
    };

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let allocator = Allocator::new(pool.ns.clone(), &pool.sim);
                for _ in 0..ROUNDS {
                    allocator
                        .allocate_direct(DeviceType::Encoder, 0, tiny)
                        .unwrap();
                }
            });
        }
    });

    let encoders = monitor::list_devices(&pool.ns, DeviceType::Encoder).unwrap();
    assert_eq!(
        encoders[0].xcode_load_pixel,
        tiny.pixel_rate() * (THREADS * ROUNDS) as u64
    );

    pool.teardown();
}

#[test_log::test]
fn direct_allocation_of_unknown_guid_fails() {
    let pool = TestPool::new("direct404", 1);
    init(&pool);

    let err = pool
        .allocator()
        .allocate_direct(DeviceType::Encoder, 42, hd30())
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::NotFound {
            device_type: DeviceType::Encoder,
            guid: 42
        }
    ));

    pool.teardown();
}

#[test_log::test]
fn block_path_lookup_finds_the_card() {
    let pool = TestPool::new("blockpath", 2);
    init(&pool);

    let block = format!("{}n1", pool.card_path(1).display());
    assert_eq!(
        monitor::guid_by_block_path(&pool.ns, DeviceType::Decoder, &block).unwrap(),
        1
    );
    let err =
        monitor::guid_by_block_path(&pool.ns, DeviceType::Decoder, "/dev/nope").unwrap_err();
    assert!(matches!(err, PoolError::UnknownDevice { .. }));

    pool.teardown();
}

#[test_log::test]
fn remove_all_clears_every_segment() {
    let pool = TestPool::new("removeall", 2);
    init(&pool);

    pool.registrar().remove_all().unwrap();
    assert!(!DevicePool::exists(&pool.ns));
    assert!(matches!(
        monitor::list_all(&pool.ns),
        Err(PoolError::PoolNotInitialized)
    ));
}

#[test_log::test]
fn incompatible_firmware_is_kept_out() {
    let pool = TestPool::new("fwgate", 1);
    let mut old = SimDevice::new(pool.card_path(1));
    old.fw_rev = "259rZZ09".to_string();
    std::fs::File::create(pool.card_path(1)).unwrap();
    pool.sim.insert_device(old);

    init(&pool);
    assert_eq!(pool.guids(DeviceType::Decoder), vec![0]);

    pool.teardown();
}

#[test_log::test]
fn core_compatible_firmware_is_flagged() {
    let pool = TestPool::new("fwwarn", 0);
    let mut dev = SimDevice::new(pool.card_path(0));
    dev.fw_rev = "250r1E09".to_string();
    std::fs::File::create(pool.card_path(0)).unwrap();
    pool.sim.insert_device(dev);

    init(&pool);
    let decoders = monitor::list_devices(&pool.ns, DeviceType::Decoder).unwrap();
    assert!(decoders[0].fw_compat_warning);

    pool.teardown();
}
