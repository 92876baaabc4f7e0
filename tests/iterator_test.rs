#[cfg(test)]
mod tests {
    use ferry::exporter::{FaultPlan, LoopbackExporter, Resolver};
    use ferry::handle::InputHandle;
    use ferry::iterator::{BincodeCodec, IoIterator, IteratorClient, IteratorServer, JsonCodec, LineIterator};
    use ferry::monitor::TransferStats;
    use ferry::{RetryPolicy, StreamConfig, StreamError};
    use serde::{Deserialize, Serialize};
    use std::fs::{self, File};
    use std::io::BufReader;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        seq: u64,
        path: String,
        size: u64,
    }

    fn entry(seq: u64) -> Entry {
        Entry {
            seq,
            path: format!("dir/{:04}/file-{seq}.dat", seq % 37),
            size: seq * 512,
        }
    }

    fn resolver(exporter: &LoopbackExporter) -> Arc<dyn Resolver> {
        Arc::new(exporter.clone())
    }

    #[test]
    fn test_pipe_fed_objects_arrive_in_order() -> anyhow::Result<()> {
        for config in [StreamConfig::uncompressed(), StreamConfig::default()] {
            let config = config.with_chunk_size(256);
            let exporter = LoopbackExporter::new();
            let (server, mut sink) = IteratorServer::from_pipe(
                BincodeCodec::<Entry>::default(),
                &config,
                Arc::new(TransferStats::new()),
            )?;
            let handle = server.export(&exporter, &config)?;
            let handle = InputHandle::from_bytes(&handle.to_bytes()?)?;

            let producer = thread::spawn(move || -> Result<(), StreamError> {
                for seq in 0..2_000 {
                    sink.add_next(entry(seq))?;
                }
                sink.set_finished()
            });

            let client = IteratorClient::new(
                handle.open(resolver(&exporter)),
                BincodeCodec::<Entry>::default(),
            );
            let received = client.collect::<Result<Vec<_>, _>>()?;
            producer.join().expect("producer panicked")?;

            assert_eq!(received.len(), 2_000);
            assert!(received.iter().enumerate().all(|(i, e)| *e == entry(i as u64)));
        }
        Ok(())
    }

    #[test]
    fn test_consumer_closing_early_stops_producer() -> anyhow::Result<()> {
        let config = StreamConfig::uncompressed().with_chunk_size(128);
        let exporter = LoopbackExporter::new();
        let stats = Arc::new(TransferStats::new());
        let (server, mut sink) =
            IteratorServer::from_pipe(JsonCodec::<Entry>::default(), &config, stats.clone())?;
        let handle = server.export(&exporter, &config)?;

        let producer = thread::spawn(move || {
            let mut sent = 0u64;
            loop {
                match sink.add_next(entry(sent)) {
                    Ok(()) => sent += 1,
                    Err(err) => return (sent, err),
                }
            }
        });

        let mut client =
            IteratorClient::new(handle.open(resolver(&exporter)), JsonCodec::<Entry>::default());
        for seq in 0..10 {
            assert_eq!(client.next_item()?, Some(entry(seq)));
        }
        client.close()?;

        let (sent, err) = producer.join().expect("producer panicked");
        assert!(sent >= 10);
        assert!(matches!(err, StreamError::Aborted));
        assert!(server.stream().is_closed());
        assert!(!stats.snapshot().clean_close);
        assert_eq!(exporter.exported_count(), 0);
        Ok(())
    }

    #[test]
    fn test_objects_survive_lost_responses() -> anyhow::Result<()> {
        let config = StreamConfig::uncompressed()
            .with_chunk_size(200)
            .with_no_delay(true)
            .with_retry(RetryPolicy::Simple {
                max_retries: 3,
                backoff_ms: 0,
            });
        let exporter = LoopbackExporter::with_faults(FaultPlan::new().lose_every_nth_response(4));
        let (server, mut sink) = IteratorServer::from_pipe(
            BincodeCodec::<Entry>::default(),
            &config,
            Arc::new(TransferStats::new()),
        )?;
        let handle = server.export(&exporter, &config)?;

        let producer = thread::spawn(move || -> Result<(), StreamError> {
            for seq in 0..300 {
                sink.add_next(entry(seq))?;
            }
            sink.set_finished()
        });

        let client = IteratorClient::new(
            handle.open(resolver(&exporter)),
            BincodeCodec::<Entry>::default(),
        );
        let received = client.collect::<Result<Vec<_>, _>>()?;
        producer.join().expect("producer panicked")?;
        assert_eq!(received, (0..300).map(entry).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_lines_of_a_file_as_objects() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("names.txt");
        fs::write(&path, "alpha\n  beta  \n\ngamma\n")?;

        let config = StreamConfig::default();
        let exporter = LoopbackExporter::new();
        let lines = LineIterator::new(BufReader::new(File::open(&path)?))
            .trimmed(true)
            .skip_blank(true);
        let server = IteratorServer::new(
            lines,
            JsonCodec::<String>::default(),
            &config,
            Arc::new(TransferStats::new()),
        )?;
        let handle = server.export(&exporter, &config)?;

        let client = IteratorClient::new(
            handle.open(resolver(&exporter)),
            JsonCodec::<String>::default(),
        );
        let names = client.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        Ok(())
    }
}
