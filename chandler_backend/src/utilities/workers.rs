use std::{future::Future, pin::Pin, sync::mpsc, time::Duration};

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, error};

pub type Job = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

enum WorkItem {
	Job { label: String, job: Job },
	Barrier(mpsc::Sender<()>),
}

/// Serialized background queue for fire-and-forget work.
///
/// Jobs run one at a time, in submission order, on a dedicated thread with
/// its own runtime. Errors and panics are logged and never reach the caller,
/// so work queued from the render path cannot affect it.
#[derive(Clone)]
pub struct WorkQueue {
	sender: UnboundedSender<WorkItem>,
}

impl WorkQueue {
	pub fn start(name: &str) -> std::io::Result<Self> {
		let (sender, mut receiver) = unbounded_channel::<WorkItem>();
		let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
		let thread_name = String::from(name);
		std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
			runtime.block_on(async move {
				while let Some(item) = receiver.recv().await {
					match item {
						WorkItem::Job { label, job } => {
							debug!(queue = %thread_name, job = %label, "running background job");
							match tokio::spawn(job).await {
								Ok(Ok(())) => {}
								Ok(Err(err)) => error!(queue = %thread_name, job = %label, "background job failed: {err:?}"),
								Err(err) => error!(queue = %thread_name, job = %label, "background job panicked: {err}"),
							}
						}
						WorkItem::Barrier(done) => {
							done.send(()).ok();
						}
					}
				}
			});
		})?;
		return Ok(WorkQueue { sender });
	}

	/// Queue a job. Silently dropped if the worker has shut down.
	pub fn spawn<F>(&self, label: impl Into<String>, job: F)
	where
		F: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let label = label.into();
		if self.sender.send(WorkItem::Job { label: label.clone(), job: Box::pin(job) }).is_err() {
			error!(job = %label, "work queue is closed, dropping job");
		}
	}

	/// Block until everything queued before this call has finished.
	///
	/// Must not be called from inside a job. Returns `false` on timeout.
	pub fn flush(&self, timeout: Duration) -> bool {
		let (done, wait) = mpsc::channel();
		if self.sender.send(WorkItem::Barrier(done)).is_err() {
			return false;
		}
		return wait.recv_timeout(timeout).is_ok();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	#[test]
	fn runs_jobs_in_order_and_survives_failures() {
		let queue = WorkQueue::start("test-worker").unwrap();
		let counter = Arc::new(AtomicUsize::new(0));

		let c1 = Arc::clone(&counter);
		queue.spawn("first", async move {
			c1.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});
		queue.spawn("failing", async move { Err(anyhow::anyhow!("nope")) });
		let c2 = Arc::clone(&counter);
		queue.spawn("second", async move {
			assert_eq!(c2.fetch_add(1, Ordering::SeqCst), 1);
			Ok(())
		});

		assert!(queue.flush(Duration::from_secs(5)));
		assert_eq!(counter.load(Ordering::SeqCst), 2);
	}
}
