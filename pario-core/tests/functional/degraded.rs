// vim: tw=80
//! I/O while devices are failed, repairing, or repaired
use super::*;

fn declustered() -> HarnessBuilder {
    HarnessBuilder::new()
}

fn double_parity() -> HarnessBuilder {
    let mut builder = HarnessBuilder::new();
    builder.geometry(4, 2, 10).unit_pages(2);
    builder
}

fn rotating() -> HarnessBuilder {
    let mut builder = HarnessBuilder::new();
    builder.geometry(3, 1, 5).algorithm(LayoutAlgorithm::Rotating);
    builder
}

/// Fill four groups of a file with random data
async fn populate(h: &Harness, fid: Fid, seed: u8) -> Vec<u8> {
    let gds = h.client.layout().group_data_size();
    let mut rng = rng(seed);
    let mut model = Vec::new();
    let wbuf = random_bytes(&mut rng, 4 * gds as usize - 1000);
    h.write_model(fid, &mut model, 0, &wbuf).await;
    model
}

mod read {
    use pario_core::Error;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use super::*;

    /// With up to K devices failed, every byte is still readable
    #[rstest]
    #[case::declustered(declustered(), &[2])]
    #[case::double_parity(double_parity(), &[1, 6])]
    #[case::rotating(rotating(), &[0])]
    #[tokio::test]
    async fn k_failed(#[case] builder: HarnessBuilder, #[case] devs: &[u32]) {
        let h = builder.build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 10).await;
        for dev in devs {
            t!(h.machine.set_state(*dev, DeviceState::Failed));
            h.store.erase(*dev);
        }
        assert_eq!(h.read_all(fid).await, model);

        // Unaligned reads, too
        let mut rbuf = vec![0u8; 10_000];
        let r = t!(h.client.read_at(fid, 1234, &mut rbuf).await);
        assert_eq!(r, 10_000);
        assert_eq!(&rbuf[..], &model[1234..11234]);
        assert_eq!(h.client.buf_stats().live(), 0);
    }

    /// Offline devices are as unreadable as failed ones
    #[tokio::test]
    async fn offline() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 11).await;
        t!(h.machine.set_state(1, DeviceState::Offline));
        assert_eq!(h.read_all(fid).await, model);
    }

    /// More than K lost devices fail the request
    #[tokio::test]
    async fn too_many_failed() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        populate(&h, fid, 12).await;
        // The first group's first two data units live on devices 0 and 1
        t!(h.machine.set_state(0, DeviceState::Failed));
        t!(h.machine.set_state(1, DeviceState::Failed));
        let mut buf = vec![0u8; 1000];
        let r = h.client.read_at(fid, 0, &mut buf).await;
        assert_eq!(r, Err(Error::EIO));
        assert_eq!(h.client.buf_stats().live(), 0);
        let stats = h.client.stats().await;
        assert_eq!(stats.failed, 1);
    }

    /// A device that returns errors before the pool notices it is gone fails
    /// the request.  Once the pool marks it failed, reads reconstruct its
    /// data.
    #[tokio::test]
    async fn failing_device() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 13).await;
        h.store.inject_error(2, Error::EIO);
        let mut buf = vec![0u8; model.len()];
        let r = h.client.read_at(fid, 0, &mut buf).await;
        assert_eq!(r, Err(Error::EIO));

        t!(h.machine.set_state(2, DeviceState::Failed));
        h.store.clear_errors();
        assert_eq!(h.read_all(fid).await, model);
    }

    /// A device that comes back online is read again, even though the
    /// client's view still says it is offline
    #[tokio::test]
    async fn back_online() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 15).await;
        t!(h.machine.set_state(2, DeviceState::Offline));
        assert_eq!(h.read_all(fid).await, model);
        t!(h.machine.set_state(2, DeviceState::Online));
        assert_eq!(h.read_all(fid).await, model);
    }

    /// The client's cached pool view goes stale when a device fails.  The
    /// storage service rejects the first attempt, and the client retries with
    /// a fresh view.
    #[tokio::test]
    async fn stale_view() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 14).await;
        t!(h.machine.set_state(4, DeviceState::Failed));
        let submitted = h.store.submitted();
        assert_eq!(h.read_all(fid).await, model);
        let stats = h.client.stats().await;
        assert_eq!(stats.failed, 0);
        // Every target of the first attempt was refused
        assert!(h.store.submitted() - submitted > 7);
    }
}

mod repaired {
    use pretty_assertions::assert_eq;
    use super::*;

    /// Once a device is repaired, its units come from the spares
    #[tokio::test]
    async fn read() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 20).await;
        h.fail_and_repair(fid, 2);
        h.store.erase(2);
        assert_eq!(h.read_all(fid).await, model);
    }

    /// Writes to a repaired device's units go to the spares
    #[tokio::test]
    async fn write() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut model = populate(&h, fid, 21).await;
        h.fail_and_repair(fid, 3);
        h.store.erase(3);
        let mut rng = rng(22);
        for _ in 0..8 {
            let offset = rng.gen_range(0..4 * gds);
            let len = rng.gen_range(1..2 * PAGE as usize);
            let wbuf = random_bytes(&mut rng, len);
            h.write_model(fid, &mut model, offset, &wbuf).await;
        }
        assert_eq!(h.read_all(fid).await, model);
        // Nothing may land on the repaired device
        assert_eq!(
            h.store.read_raw(TargetId::new(fid, 3), 0, gds as usize),
            vec![0u8; gds as usize]
        );
    }

    /// Repairing a device rebuilds the spares it held for devices repaired
    /// before it
    #[tokio::test]
    async fn in_sequence() {
        let h = double_parity().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut model = populate(&h, fid, 23).await;
        h.fail_and_repair(fid, 1);
        h.store.erase(1);
        h.fail_and_repair(fid, 6);
        h.store.erase(6);
        assert_eq!(h.read_all(fid).await, model);

        let mut rng = rng(24);
        for _ in 0..8 {
            let offset = rng.gen_range(0..4 * gds);
            let len = rng.gen_range(1..3 * PAGE as usize);
            let wbuf = random_bytes(&mut rng, len);
            h.write_model(fid, &mut model, offset, &wbuf).await;
        }
        assert_eq!(h.read_all(fid).await, model);
    }

    /// A device returning online gives up only its own spare slot.  Devices
    /// that are merely offline don't take one.
    #[tokio::test]
    async fn slots_are_stable() {
        let h = double_parity().build();
        let fid = Fid::new(0, 1);
        let model = populate(&h, fid, 25).await;
        t!(h.machine.set_state(2, DeviceState::Offline));
        h.fail_and_repair(fid, 6);
        h.store.erase(6);
        assert_eq!(h.machine.spare_slot(2), None);
        assert_eq!(h.machine.spare_slot(6), Some(0));
        assert_eq!(h.read_all(fid).await, model);

        t!(h.machine.set_state(2, DeviceState::Online));
        assert_eq!(h.machine.spare_slot(6), Some(0));
        assert_eq!(h.read_all(fid).await, model);

        // The next failure takes the next slot
        h.fail_and_repair(fid, 3);
        h.store.erase(3);
        assert_eq!(h.machine.spare_slot(3), Some(1));
        assert_eq!(h.read_all(fid).await, model);
    }
}

mod write {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use super::*;

    /// Writing with up to K devices failed drops their units, yet all the
    /// data can be read back.
    #[rstest]
    #[case::declustered(declustered(), &[2])]
    #[case::double_parity(double_parity(), &[3, 7])]
    #[case::rotating(rotating(), &[4])]
    #[tokio::test]
    async fn k_failed(#[case] builder: HarnessBuilder, #[case] devs: &[u32]) {
        let h = builder.build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut model = populate(&h, fid, 30).await;
        for dev in devs {
            t!(h.machine.set_state(*dev, DeviceState::Failed));
        }
        let mut rng = rng(31);
        for _ in 0..12 {
            let offset = rng.gen_range(0..5 * gds);
            let len = rng.gen_range(1..gds as usize);
            let wbuf = random_bytes(&mut rng, len);
            h.write_model(fid, &mut model, offset, &wbuf).await;
        }
        assert_eq!(h.read_all(fid).await, model);
        assert_eq!(h.client.buf_stats().live(), 0);
    }

    /// Writes reach a device that came back online, even though the client's
    /// view still says it is offline
    #[tokio::test]
    async fn back_online() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut model = populate(&h, fid, 32).await;
        t!(h.machine.set_state(2, DeviceState::Offline));
        assert_eq!(h.read_all(fid).await, model);
        t!(h.machine.set_state(2, DeviceState::Online));
        let mut rng = rng(33);
        for _ in 0..8 {
            let offset = rng.gen_range(0..3 * gds);
            let len = rng.gen_range(1..gds as usize);
            let wbuf = random_bytes(&mut rng, len);
            h.write_model(fid, &mut model, offset, &wbuf).await;
        }
        assert_eq!(h.read_all(fid).await, model);
        for group in 0..4 {
            h.check_parity(fid, group);
        }
    }
}
