// vim: tw=80
//! Partial-group writes
use super::*;

mod read_old {
    use pretty_assertions::assert_eq;
    use super::*;

    /// Parity read back from the parity unit's device, one page per row
    fn parity_rows(h: &Harness, fid: Fid) -> Vec<Vec<u8>> {
        let layout = h.client.layout();
        let addr = layout.src_to_tgt(SrcAddr::new(0, layout.n()));
        (0..layout.rows() as u64)
            .map(|row| h.store.read_raw(TargetId::new(fid, addr.dev),
                layout.target_offset(addr.frame, row * PAGE), PAGE as usize))
            .collect()
    }

    /// Overwriting the first two pages of a full group reads only the old
    /// pages and the parity, and updates only the affected parity rows.
    #[test_log::test(tokio::test)]
    async fn two_pages() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut rng = rng(3);
        let mut model = Vec::new();
        let wbuf = random_bytes(&mut rng, gds as usize);
        h.write_model(fid, &mut model, 0, &wbuf).await;
        let before = parity_rows(&h, fid);

        let submitted = h.store.submitted();
        let wbuf = random_bytes(&mut rng, 2 * PAGE as usize);
        h.write_model(fid, &mut model, 0, &wbuf).await;
        // Read the old data unit and the parity unit, then write both
        assert_eq!(h.store.submitted() - submitted, 4);

        let after = parity_rows(&h, fid);
        assert_ne!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert_eq!(after[2], before[2]);
        h.check_parity(fid, 0);
        assert_eq!(h.read_all(fid).await, model);
        assert_eq!(h.client.buf_stats().live(), 0);
    }

    /// A partial page keeps the old bytes around the new ones
    #[tokio::test]
    async fn partial_page() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let mut rng = rng(4);
        let mut model = Vec::new();
        let wbuf = random_bytes(&mut rng, 5 * PAGE as usize);
        h.write_model(fid, &mut model, 0, &wbuf).await;
        h.write_model(fid, &mut model, 2 * PAGE + 10, &[0u8; 50]).await;
        h.check_parity(fid, 0);
        assert_eq!(h.read_all(fid).await, model);
    }
}

mod read_rest {
    use pretty_assertions::assert_eq;
    use super::*;

    /// A write that touches most of a group reads the few pages it doesn't
    /// cover and recomputes the parity from scratch.
    #[tokio::test]
    async fn most_of_group() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut rng = rng(5);
        let mut model = Vec::new();
        let wbuf = random_bytes(&mut rng, gds as usize);
        h.write_model(fid, &mut model, 0, &wbuf).await;

        let submitted = h.store.submitted();
        let wbuf = random_bytes(&mut rng, 7 * PAGE as usize);
        h.write_model(fid, &mut model, 100, &wbuf).await;
        // Read the first and last data units, then write the whole group
        assert_eq!(h.store.submitted() - submitted, 6);
        h.check_parity(fid, 0);
        assert_eq!(h.read_all(fid).await, model);
        assert_eq!(h.client.buf_stats().live(), 0);
    }
}

/// Groups that straddle end of file
mod eof {
    use pretty_assertions::assert_eq;
    use super::*;

    #[tokio::test]
    async fn extend() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        let gds = h.client.layout().group_data_size();
        let mut rng = rng(6);
        let mut model = Vec::new();
        let wbuf = random_bytes(&mut rng, 4 * PAGE as usize + 100);
        h.write_model(fid, &mut model, 0, &wbuf).await;
        let wbuf = random_bytes(&mut rng, 3 * PAGE as usize);
        h.write_model(fid, &mut model, 4 * PAGE + 50, &wbuf).await;
        let wbuf = random_bytes(&mut rng, gds as usize);
        h.write_model(fid, &mut model, gds - 10, &wbuf).await;
        for group in 0..3 {
            h.check_parity(fid, group);
        }
        assert_eq!(h.read_all(fid).await, model);
    }

    /// Bytes past end of file in a partial page read back as zeros after the
    /// file grows over them.
    #[tokio::test]
    async fn tail_of_page() {
        let h = HarnessBuilder::new().build();
        let fid = Fid::new(0, 1);
        t!(h.client.write_at(fid, 0, &[9u8; 100]).await);
        t!(h.client.write_at(fid, 200, &[8u8; 100]).await);
        let data = h.read_all(fid).await;
        assert_eq!(&data[..100], &[9u8; 100][..]);
        assert_eq!(&data[100..200], &[0u8; 100][..]);
        assert_eq!(&data[200..], &[8u8; 100][..]);
        h.check_parity(fid, 0);
    }
}
