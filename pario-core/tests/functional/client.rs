// vim: tw=80
use super::*;

mod round_trip {
    use pario_core::ioreq::UserIo;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
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

    /// Tiny protocol requests, so every target needs several of them
    fn small_fops() -> HarnessBuilder {
        let mut builder = HarnessBuilder::new();
        builder.max_fop_segs(1);
        builder
    }

    /// Unaligned writes spanning several groups read back exactly
    #[rstest]
    #[case::declustered(declustered())]
    #[case::double_parity(double_parity())]
    #[case::rotating(rotating())]
    #[case::small_fops(small_fops())]
    #[tokio::test]
    async fn unaligned(#[case] builder: HarnessBuilder) {
        let h = builder.build();
        let fid = Fid::new(0, 1);
        let mut rng = rng(1);
        let mut model = Vec::new();
        let gds = h.client.layout().group_data_size();
        let wbuf = random_bytes(&mut rng, (3 * gds + 1234) as usize);
        h.write_model(fid, &mut model, 777, &wbuf).await;
        assert_eq!(h.client.file_size(fid), 777 + wbuf.len() as u64);
        assert_eq!(h.read_all(fid).await, model);

        // Overwrite a piece in the middle, straddling a group boundary
        let wbuf = random_bytes(&mut rng, 3 * PAGE as usize + 17);
        h.write_model(fid, &mut model, gds - PAGE - 5, &wbuf).await;
        assert_eq!(h.read_all(fid).await, model);
        assert_eq!(h.client.buf_stats().live(), 0);
    }

    /// Unwritten ranges below end of file read as zeros
    #[tokio::test]
    async fn hole() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        t!(h.client.write_at(fid, 2 * gds + 100, &[0xeeu8; 100]).await);
        let data = h.read_all(fid).await;
        assert_eq!(data.len() as u64, 2 * gds + 200);
        assert!(data[..(2 * gds + 100) as usize].iter().all(|b| *b == 0));
        assert!(data[(2 * gds + 100) as usize..].iter().all(|b| *b == 0xee));
    }

    /// Files are independent of each other
    #[tokio::test]
    async fn two_files() {
        let h = HarnessBuilder::new().build();
        let a = Fid::new(0, 1);
        let b = Fid::new(0, 2);
        t!(h.client.write_at(a, 0, &[1u8; 5000]).await);
        t!(h.client.write_at(b, 0, &[2u8; 3000]).await);
        assert_eq!(h.read_all(a).await, vec![1u8; 5000]);
        assert_eq!(h.read_all(b).await, vec![2u8; 3000]);
    }

    /// One request may carry several buffers, in any order
    #[tokio::test]
    async fn vectored() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut rng = rng(2);
        let a = random_bytes(&mut rng, 5000);
        let b = random_bytes(&mut rng, 300);
        let c = random_bytes(&mut rng, PAGE as usize);
        let io = UserIo::Write(vec![(gds + 10, &b[..]), (0, &a[..]),
                                    (5000, &c[..])]);
        let r = t!(h.client.submit(fid, io).await);
        assert_eq!(r, 5300 + PAGE);
        assert_eq!(h.client.file_size(fid), gds + 310);

        let mut ra = vec![0u8; 5000];
        let mut rb = vec![0u8; 300];
        let mut rc = vec![0u8; PAGE as usize];
        let io = UserIo::Read(vec![(5000, &mut rc[..]), (gds + 10, &mut rb[..]),
                                   (0, &mut ra[..])]);
        let r = t!(h.client.submit(fid, io).await);
        assert_eq!(r, 5300 + PAGE);
        assert_eq!(ra, a);
        assert_eq!(rb, b);
        assert_eq!(rc, c);
    }
}

mod stats {
    use pario_core::Error;
    use pretty_assertions::assert_eq;
    use super::*;

    /// An allocation failure fails the request without leaking buffers, and
    /// the client keeps working afterwards.
    #[test_log::test(tokio::test)]
    async fn enomem() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        t!(h.client.write_at(fid, 0, &vec![3u8; gds as usize]).await);

        h.client.buf_stats().inject_failure(3);
        let r = h.client.write_at(fid, 0, &vec![4u8; 2 * gds as usize]).await;
        assert_eq!(r, Err(Error::ENOMEM));
        assert_eq!(h.client.buf_stats().live(), 0);
        assert_eq!(h.client.file_size(fid), gds);
        let stats = h.client.stats().await;
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.failed, 1);

        assert_eq!(h.read_all(fid).await, vec![3u8; gds as usize]);
        assert_eq!(h.client.buf_stats().live(), 0);
    }

    /// Every protocol request that completes is counted
    #[tokio::test]
    async fn fops() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        t!(h.client.write_at(fid, 0, &vec![0u8; gds as usize]).await);
        // Three data units and one parity unit, each on its own device
        assert_eq!(h.client.stats().await.fops, 4);
        assert_eq!(h.store.submitted(), 4);
    }
}

/// Random writes checked against a plain byte vector
mod workload {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(7)]
    #[case(42)]
    #[tokio::test]
    async fn random(#[case] seed: u8) {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(1, seed.into());
        let gds = h.client.layout().group_data_size();
        let mut rng = rng(seed);
        let mut model = Vec::new();
        for _ in 0..40 {
            let offset = rng.gen_range(0..4 * gds);
            let len = rng.gen_range(1..gds as usize);
            let wbuf = random_bytes(&mut rng, len);
            h.write_model(fid, &mut model, offset, &wbuf).await;

            let offset = rng.gen_range(0..model.len());
            let len = rng.gen_range(1..=model.len() - offset);
            let mut rbuf = vec![0u8; len];
            let r = t!(h.client.read_at(fid, offset as u64, &mut rbuf).await);
            assert_eq!(r, len as u64);
            assert_eq!(&rbuf[..], &model[offset..offset + len]);
        }
        assert_eq!(h.read_all(fid).await, model);
        assert_eq!(h.client.buf_stats().live(), 0);
    }
}
