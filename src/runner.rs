// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Feeds newline delimited messages from a reader into a [`BatchOutput`].

use crate::{
    errors::Error,
    output::{BatchOutput, BatchPolicy, Batcher, Message, OutputContext},
};
use futures::FutureExt;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::Semaphore,
    task::JoinSet,
    time::MissedTickBehavior,
};

/// What happened during a run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// non blank lines read
    pub messages: usize,
    /// batches handed to the output
    pub batches: usize,
    /// messages the output accepted
    pub written: usize,
    /// messages that were rejected or lost with their batch
    pub failed: usize,
    /// batches that failed as a whole
    pub failed_batches: usize,
}

impl RunReport {
    fn account(&mut self, ctx: &OutputContext, len: usize, res: crate::Result<()>) {
        match res {
            Ok(()) => self.written += len,
            Err(Error::Batch(errors)) => {
                for (idx, e) in errors.iter() {
                    warn!("{ctx} Message {idx} of the batch was rejected: {e}");
                }
                self.failed += errors.len();
                self.written += len.saturating_sub(errors.len());
            }
            Err(e) => {
                error!("{ctx} Batch of {len} messages failed: {e}");
                self.failed += len;
                self.failed_batches += 1;
            }
        }
    }
}

struct Dispatcher<'ctx> {
    output: Arc<dyn BatchOutput>,
    ctx: &'ctx OutputContext,
    permits: Arc<Semaphore>,
    tasks: JoinSet<(usize, crate::Result<()>)>,
    report: RunReport,
}

impl Dispatcher<'_> {
    async fn dispatch(&mut self, batch: Vec<Message>) -> anyhow::Result<()> {
        // waits while max_in_flight batches are being written
        let permit = self.permits.clone().acquire_owned().await?;
        self.report.batches += 1;
        let output = self.output.clone();
        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            let res = output.write_batch(&ctx, &batch).await;
            drop(permit);
            (batch.len(), res)
        });
        // collect what's done already so results don't pile up
        while let Some(Some(done)) = self.tasks.join_next().now_or_never() {
            let (len, res) = done?;
            self.report.account(self.ctx, len, res);
        }
        Ok(())
    }

    async fn finish(mut self) -> anyhow::Result<RunReport> {
        while let Some(done) = self.tasks.join_next().await {
            let (len, res) = done?;
            self.report.account(self.ctx, len, res);
        }
        Ok(self.report)
    }
}

/// Reads lines from `reader` until it is exhausted and writes them in batches
/// to `output`, with at most `max_in_flight` batches written concurrently.
///
/// Blank lines are skipped. Failing batches are logged and counted, they
/// don't stop the run.
///
/// # Errors
/// if reading fails
pub async fn run<R>(
    output: Arc<dyn BatchOutput>,
    ctx: &OutputContext,
    reader: R,
    policy: BatchPolicy,
    max_in_flight: usize,
) -> anyhow::Result<RunReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut batcher = Batcher::new(policy);
    let mut ticker = batcher.policy().period().map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut dispatcher = Dispatcher {
        output,
        ctx,
        permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        tasks: JoinSet::new(),
        report: RunReport::default(),
    };

    loop {
        let line = if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                line = lines.next_line() => line?,
                _ = ticker.tick() => {
                    if let Some(batch) = batcher.flush() {
                        debug!("{ctx} Flushing {} messages after the batching period", batch.len());
                        dispatcher.dispatch(batch).await?;
                    }
                    continue;
                }
            }
        } else {
            lines.next_line().await?
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        dispatcher.report.messages += 1;
        if batcher.add(Message::from(line.into_bytes())) {
            if let Some(batch) = batcher.flush() {
                dispatcher.dispatch(batch).await?;
            }
        }
    }
    if let Some(batch) = batcher.flush() {
        dispatcher.dispatch(batch).await?;
    }

    let report = dispatcher.finish().await?;
    info!(
        "{ctx} Done: {} messages in {} batches, {} written, {} failed",
        report.messages, report.batches, report.written, report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BatchError;
    use pretty_assertions::assert_eq;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tokio::io::{AsyncWriteExt, BufReader};

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<String>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl Recorder {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().map(|b| b.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl BatchOutput for Recorder {
        async fn connect(&self, _ctx: &OutputContext) -> crate::Result<()> {
            Ok(())
        }

        async fn write_batch(&self, _ctx: &OutputContext, batch: &[Message]) -> crate::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let lines: Vec<String> = batch
                .iter()
                .map(|m| {
                    m.as_bytes()
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                        .unwrap_or_default()
                })
                .collect();
            if let Ok(mut batches) = self.batches.lock() {
                batches.push(lines.clone());
            }

            if lines.iter().any(|l| l == "boom") {
                return Err(Error::NotConnected);
            }
            let mut errors = BatchError::new(batch.len());
            for (idx, _) in lines.iter().enumerate().filter(|(_, l)| *l == "bad") {
                errors.failed(idx, anyhow::anyhow!("bad line"));
            }
            if errors.is_empty() {
                Ok(())
            } else {
                Err(errors.into())
            }
        }

        async fn close(&self, _ctx: &OutputContext) -> crate::Result<()> {
            Ok(())
        }
    }

    fn policy(count: usize) -> BatchPolicy {
        BatchPolicy {
            count,
            ..BatchPolicy::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_by_count_and_skips_blank_lines() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let input = "a\nb\n\n  \nc\nd\ne";
        let report = run(
            recorder.clone(),
            &OutputContext::new("test"),
            BufReader::new(input.as_bytes()),
            policy(2),
            1,
        )
        .await?;

        assert_eq!(
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string(), "d".to_string()],
                vec!["e".to_string()],
            ],
            recorder.batches()
        );
        assert_eq!(
            RunReport {
                messages: 5,
                batches: 3,
                written: 5,
                failed: 0,
                failed_batches: 0,
            },
            report
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_are_counted() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let input = "a\nbad\nc\nboom\ne\nf\n";
        let report = run(
            recorder.clone(),
            &OutputContext::new("test"),
            BufReader::new(input.as_bytes()),
            policy(3),
            4,
        )
        .await?;

        assert_eq!(
            RunReport {
                messages: 6,
                batches: 2,
                written: 2,
                failed: 4,
                failed_batches: 1,
            },
            report
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_batches_are_bounded() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Recorder::default()
        });
        let input = (0..20).map(|i| format!("{i}\n")).collect::<String>();
        let report = run(
            recorder.clone(),
            &OutputContext::new("test"),
            BufReader::new(input.as_bytes()),
            BatchPolicy::default(),
            3,
        )
        .await?;

        assert_eq!(20, report.batches);
        assert_eq!(20, report.written);
        let max = recorder.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "{max} batches in flight");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flushes_after_the_period() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let (mut writer, reader) = tokio::io::duplex(1024);
        let output: Arc<dyn BatchOutput> = recorder.clone();
        let handle = tokio::spawn(async move {
            run(
                output,
                &OutputContext::new("test"),
                BufReader::new(reader),
                BatchPolicy {
                    count: 100,
                    period_ms: 10,
                    ..BatchPolicy::default()
                },
                1,
            )
            .await
        });

        writer.write_all(b"a\n").await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(vec![vec!["a".to_string()]], recorder.batches());

        writer.write_all(b"b\n").await?;
        drop(writer);
        let report = handle.await??;
        assert_eq!(2, report.messages);
        assert_eq!(2, report.written);
        Ok(())
    }
}
