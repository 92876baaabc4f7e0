#[cfg(test)]
mod tests {
    use ferry::exporter::{Exporter, FaultPlan, LoopbackExporter, Resolver};
    use ferry::handle::{InputHandle, OutputHandle};
    use ferry::monitor::{StreamMonitor, TransferStats};
    use ferry::protocol::StreamControl;
    use ferry::{InputStreamServer, OutputStreamServer, RetryPolicy, StreamConfig};
    use std::fs::{self, File};
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const FILE_SIZE: usize = 277_672;

    /// Counts first-time packets and their bytes.
    #[derive(Default)]
    struct PacketCounter {
        packets: AtomicUsize,
        bytes: AtomicU64,
        reattempts: AtomicUsize,
    }

    impl StreamMonitor for PacketCounter {
        fn bytes_moved(&self, _stream: &StreamControl, num_bytes: usize, reattempt: bool) {
            if reattempt {
                self.reattempts.fetch_add(1, Ordering::SeqCst);
            } else {
                self.packets.fetch_add(1, Ordering::SeqCst);
                self.bytes.fetch_add(num_bytes as u64, Ordering::SeqCst);
            }
        }
    }

    fn sample_text(len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len + 64);
        let mut i = 0u64;
        while out.len() < len {
            out.extend_from_slice(
                format!("{i:08}: the quick brown fox jumps over the lazy dog\n").as_bytes(),
            );
            i += 1;
        }
        out.truncate(len);
        out
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::Simple {
            max_retries: 3,
            backoff_ms: 0,
        }
    }

    /// Export a file-backed input server and pass its handle through bytes.
    fn serve_file(
        path: &std::path::Path,
        config: &StreamConfig,
        monitor: Arc<dyn StreamMonitor>,
        exporter: &LoopbackExporter,
    ) -> anyhow::Result<InputHandle> {
        let server = Arc::new(InputStreamServer::from_reader(
            File::open(path)?,
            config,
            monitor,
        )?);
        let handle = InputHandle::export(server, exporter, config)?;
        Ok(InputHandle::from_bytes(&handle.to_bytes()?)?)
    }

    fn resolver(exporter: &LoopbackExporter) -> Arc<dyn Resolver> {
        Arc::new(exporter.clone())
    }

    #[test]
    fn test_uncompressed_file_in_39_packets() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        let data = sample_text(FILE_SIZE);
        fs::write(&path, &data)?;

        let exporter = LoopbackExporter::new();
        let counter = Arc::new(PacketCounter::default());
        let config = StreamConfig::uncompressed();
        let handle = serve_file(&path, &config, counter.clone(), &exporter)?;

        let mut input = handle.open(resolver(&exporter));
        let mut received = Vec::new();
        input.read_to_end(&mut received)?;
        input.close()?;

        assert_eq!(received, data);
        assert_eq!(counter.packets.load(Ordering::SeqCst), 39);
        assert_eq!(counter.bytes.load(Ordering::SeqCst), FILE_SIZE as u64);
        assert_eq!(exporter.exported_count(), 0);
        Ok(())
    }

    #[test]
    fn test_compressed_file_moves_fewer_bytes() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        let data = sample_text(FILE_SIZE);
        fs::write(&path, &data)?;

        let exporter = LoopbackExporter::new();
        let counter = Arc::new(PacketCounter::default());
        let handle = serve_file(&path, &StreamConfig::default(), counter.clone(), &exporter)?;

        let mut input = handle.open(resolver(&exporter));
        let mut received = Vec::new();
        input.read_to_end(&mut received)?;

        assert_eq!(received, data);
        assert!(counter.bytes.load(Ordering::SeqCst) < FILE_SIZE as u64);
        Ok(())
    }

    #[test]
    fn test_empty_file_both_modes() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("empty");
        fs::write(&path, b"")?;

        for config in [StreamConfig::uncompressed(), StreamConfig::default()] {
            let exporter = LoopbackExporter::new();
            let handle = serve_file(&path, &config, Arc::new(TransferStats::new()), &exporter)?;
            let mut input = handle.open(resolver(&exporter));
            let mut received = Vec::new();
            assert_eq!(input.read_to_end(&mut received)?, 0);
        }
        Ok(())
    }

    #[test]
    fn test_lost_responses_do_not_duplicate_data() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        let data = sample_text(100_000);
        fs::write(&path, &data)?;

        for config in [StreamConfig::uncompressed(), StreamConfig::default()] {
            let config = config.with_chunk_size(1000).with_retry(fast_retry());
            let exporter =
                LoopbackExporter::with_faults(FaultPlan::new().lose_every_nth_response(3));
            let counter = Arc::new(PacketCounter::default());
            let handle = serve_file(&path, &config, counter.clone(), &exporter)?;

            let mut input = handle.open(resolver(&exporter));
            let mut received = Vec::new();
            input.read_to_end(&mut received)?;

            assert_eq!(received, data);
            assert!(counter.reattempts.load(Ordering::SeqCst) > 0);
        }
        Ok(())
    }

    #[test]
    fn test_lost_requests_are_retried() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        let data = sample_text(20_000);
        fs::write(&path, &data)?;

        let config = StreamConfig::uncompressed()
            .with_chunk_size(512)
            .with_retry(fast_retry());
        let exporter = LoopbackExporter::with_faults(
            FaultPlan::new().lose_request(2).lose_request(3).lose_request(9),
        );
        let counter = Arc::new(PacketCounter::default());
        let handle = serve_file(&path, &config, counter.clone(), &exporter)?;

        let mut input = handle.open(resolver(&exporter));
        let mut received = Vec::new();
        input.read_to_end(&mut received)?;

        assert_eq!(received, data);
        // requests that never arrived are not replays
        assert_eq!(counter.reattempts.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_without_retry_communication_failure_surfaces() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        fs::write(&path, sample_text(10_000))?;

        let config = StreamConfig::uncompressed()
            .with_chunk_size(1000)
            .with_retry(RetryPolicy::Never);
        // call 0 is using-compression, call 1 the first read
        let exporter = LoopbackExporter::with_faults(FaultPlan::new().lose_response(1));
        let handle = serve_file(&path, &config, Arc::new(TransferStats::new()), &exporter)?;

        let mut input = handle.open(resolver(&exporter));
        let err = input.read(&mut [0u8; 100]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        Ok(())
    }

    #[test]
    fn test_abort_stops_transfer() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        fs::write(&path, sample_text(FILE_SIZE))?;

        let exporter = LoopbackExporter::new();
        let stats = Arc::new(TransferStats::abort_after(10_000));
        let config = StreamConfig::uncompressed().with_retry(fast_retry());
        let handle = serve_file(&path, &config, stats.clone(), &exporter)?;

        let mut input = handle.open(resolver(&exporter));
        let mut received = Vec::new();
        let err = input.read_to_end(&mut received).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(received.len() < FILE_SIZE);
        drop(input);

        let snap = stats.snapshot();
        assert_eq!(snap.closes, 1);
        assert!(!snap.clean_close);
        Ok(())
    }

    #[test]
    fn test_skip_through_handle() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        let data = sample_text(50_000);
        fs::write(&path, &data)?;

        for config in [StreamConfig::uncompressed(), StreamConfig::default()] {
            let exporter = LoopbackExporter::new();
            let handle = serve_file(&path, &config, Arc::new(TransferStats::new()), &exporter)?;
            let mut input = handle.open(resolver(&exporter));

            let mut head = [0u8; 100];
            input.read_exact(&mut head)?;
            assert_eq!(input.skip(30_000)?, 30_000);
            let mut rest = Vec::new();
            input.read_to_end(&mut rest)?;
            assert_eq!(rest, data[30_100..].to_vec());
        }
        Ok(())
    }

    #[test]
    fn test_output_to_file_both_modes() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let data = sample_text(123_456);

        for (name, config) in [
            ("plain.txt", StreamConfig::uncompressed()),
            ("compressed.txt", StreamConfig::default()),
        ] {
            let path = temp.path().join(name);
            let exporter = LoopbackExporter::new();
            let stats = Arc::new(TransferStats::new());
            let server = Arc::new(OutputStreamServer::new(
                File::create(&path)?,
                &config,
                stats.clone(),
            )?);
            let handle = OutputHandle::export(server, &exporter, &config)?;
            let handle = OutputHandle::from_bytes(&handle.to_bytes()?)?;

            let mut output = handle.open(resolver(&exporter));
            for piece in data.chunks(1000) {
                output.write_all(piece)?;
            }
            output.close()?;

            assert_eq!(fs::read(&path)?, data);
            let snap = stats.snapshot();
            assert!(snap.clean_close);
            assert_eq!(snap.local_bytes_moved, data.len() as u64);
            assert_eq!(exporter.exported_count(), 0);
        }
        Ok(())
    }

    #[test]
    fn test_output_survives_lost_responses() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("out.txt");
        let data = sample_text(60_000);

        let config = StreamConfig::default().with_retry(fast_retry());
        let exporter = LoopbackExporter::with_faults(FaultPlan::new().lose_every_nth_response(2));
        let stats = Arc::new(TransferStats::new());
        let server = Arc::new(OutputStreamServer::new(
            File::create(&path)?,
            &config,
            stats.clone(),
        )?);
        let handle = OutputHandle::export(server, &exporter, &config)?;

        let mut output = handle.open(resolver(&exporter));
        output.write_all(&data)?;
        output.flush()?;
        output.close()?;

        assert_eq!(fs::read(&path)?, data);
        assert!(stats.snapshot().reattempts > 0);
        Ok(())
    }

    #[test]
    fn test_unclosed_output_closes_unclean() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let exporter = LoopbackExporter::new();
        let stats = Arc::new(TransferStats::new());
        let config = StreamConfig::uncompressed();
        let server = Arc::new(OutputStreamServer::new(
            File::create(temp.path().join("partial"))?,
            &config,
            stats.clone(),
        )?);
        let remote = exporter.export_output(server)?;
        let handle = OutputHandle {
            remote,
            retry: RetryPolicy::Never,
            chunk_size: 16,
            compression_level: 3,
        };

        {
            let mut output = handle.open(resolver(&exporter));
            output.write_all(b"never finished")?;
        }

        let snap = stats.snapshot();
        assert_eq!(snap.closes, 1);
        assert!(!snap.clean_close);
        Ok(())
    }

    #[test]
    fn test_unused_input_handle_closes_and_unexports() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("data.txt");
        fs::write(&path, sample_text(5_000))?;

        let exporter = LoopbackExporter::new();
        let stats = Arc::new(TransferStats::new());
        let handle = serve_file(&path, &StreamConfig::default(), stats.clone(), &exporter)?;
        assert_eq!(exporter.exported_count(), 1);

        let input = handle.open(resolver(&exporter));
        assert!(!input.is_connected());
        drop(input);

        let snap = stats.snapshot();
        assert_eq!(snap.closes, 1);
        assert!(!snap.clean_close);
        assert_eq!(exporter.exported_count(), 0);
        Ok(())
    }

    #[test]
    fn test_unused_output_handle_closes_and_unexports() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let exporter = LoopbackExporter::new();
        let stats = Arc::new(TransferStats::new());
        let config = StreamConfig::default();
        let server = Arc::new(OutputStreamServer::new(
            File::create(temp.path().join("never-written"))?,
            &config,
            stats.clone(),
        )?);
        let handle = OutputHandle::export(server, &exporter, &config)?;
        drop(handle.open(resolver(&exporter)));

        let snap = stats.snapshot();
        assert_eq!(snap.closes, 1);
        assert!(!snap.clean_close);
        assert_eq!(exporter.exported_count(), 0);
        Ok(())
    }

    #[test]
    fn test_output_handle_applies_configured_level() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let data = sample_text(123_456);

        let mut moved = Vec::new();
        for level in [1, 19] {
            let config = StreamConfig {
                compression_level: level,
                ..StreamConfig::default()
            };
            let path = temp.path().join(format!("level-{level}.txt"));
            let exporter = LoopbackExporter::new();
            let stats = Arc::new(TransferStats::new());
            let server = Arc::new(OutputStreamServer::new(
                File::create(&path)?,
                &config,
                stats.clone(),
            )?);
            let handle = OutputHandle::export(server, &exporter, &config)?;
            let handle = OutputHandle::from_bytes(&handle.to_bytes()?)?;
            assert_eq!(handle.compression_level, level);

            let mut output = handle.open(resolver(&exporter));
            output.write_all(&data)?;
            output.close()?;

            assert_eq!(fs::read(&path)?, data);
            moved.push(stats.snapshot().bytes_moved);
        }
        assert!(moved[1] < moved[0]);
        Ok(())
    }
}
