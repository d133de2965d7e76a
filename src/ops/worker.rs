// ============================================================================
// FILTER WORKER — background filter jobs on private buffer copies
// ============================================================================
//
// Jobs run on the rayon pool against a snapshot taken at submit time.  Only
// finished results come back over the channel; the editing thread commits
// them in `poll`, after checking the target still exists and still holds
// the pixels the job started from.  Anything else is discarded.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::canvas::PixelBuffer;
use crate::components::history::History;
use crate::error::FilterError;
use crate::geometry::PixelRect;
use crate::ops::filters::{self, Filter, FilterInput, ParamValue};
use crate::stack::{BufferTarget, LayerStack};
use crate::{log_err, log_info, log_warn};

pub type JobId = u64;

type JobResult = Result<Option<(PixelRect, PixelBuffer)>, FilterError>;

struct Message {
    job: JobId,
    result: JobResult,
}

struct PendingJob {
    target: BufferTarget,
    description: String,
    /// Target pixels at submit time.
    snapshot: PixelBuffer,
}

/// What happened to a finished job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Applied { job: JobId, rect: PixelRect },
    /// Nothing to change (empty region).
    NoChange { job: JobId },
    /// The document moved on; the result was dropped.
    Discarded { job: JobId },
    Failed { job: JobId, error: FilterError },
}

pub struct FilterWorker {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    next_job: JobId,
    pending: HashMap<JobId, PendingJob>,
    /// Cancelled jobs whose results have not arrived yet.
    cancelled: HashSet<JobId>,
}

impl Default for FilterWorker {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl FilterWorker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver, next_job: 1, pending: HashMap::new(), cancelled: HashSet::new() }
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    /// Validate, snapshot the target and start the job.  Edit and parameter
    /// errors are reported here, before anything is spawned.
    pub fn submit(
        &mut self,
        stack: &LayerStack,
        target: BufferTarget,
        filter: Arc<dyn Filter>,
        params: Vec<ParamValue>,
    ) -> Result<JobId, FilterError> {
        filters::validate(filter.as_ref(), &params)?;
        let input = FilterInput::capture(stack, target)?;
        let job = self.next_job;
        self.next_job += 1;
        let description = filter.name().to_string();
        self.pending.insert(
            job,
            PendingJob { target, description: description.clone(), snapshot: input.buffer.clone() },
        );

        let sender = self.sender.clone();
        rayon::spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| filters::run_filter(&input, filter.as_ref(), &params)))
                .unwrap_or_else(|payload| Err(FilterError::Panicked(description, panic_message(payload.as_ref()))));
            let _ = sender.send(Message { job, result });
        });
        Ok(job)
    }

    /// Forget a job; its result is dropped when it arrives.
    pub fn cancel(&mut self, job: JobId) {
        if self.pending.remove(&job).is_some() {
            self.cancelled.insert(job);
        }
    }

    /// Commit every finished job.  Never blocks.
    pub fn poll(&mut self, stack: &mut LayerStack, history: &mut History) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(msg) = self.receiver.try_recv() {
            if let Some(outcome) = self.finish(stack, history, msg) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Block until every submitted job has finished, committing each.
    pub fn wait(&mut self, stack: &mut LayerStack, history: &mut History) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while !self.pending.is_empty() || !self.cancelled.is_empty() {
            let Ok(msg) = self.receiver.recv() else { break };
            if let Some(outcome) = self.finish(stack, history, msg) {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    fn finish(&mut self, stack: &mut LayerStack, history: &mut History, msg: Message) -> Option<JobOutcome> {
        let job = msg.job;
        let Some(pending) = self.pending.remove(&job) else {
            self.cancelled.remove(&job);
            return None;
        };
        let (region, pixels) = match msg.result {
            Err(error) => {
                log_err!("Filter job {} ({}) failed: {}", job, pending.description, error);
                return Some(JobOutcome::Failed { job, error });
            }
            Ok(None) => return Some(JobOutcome::NoChange { job }),
            Ok(Some(result)) => result,
        };

        if !Self::still_valid(stack, &pending, region) {
            log_warn!("Discarding stale result of filter job {} ({})", job, pending.description);
            return Some(JobOutcome::Discarded { job });
        }
        if !filters::commit_result(stack, history, pending.target, region, &pixels, &pending.description) {
            return Some(JobOutcome::Discarded { job });
        }
        log_info!("Filter job {} ({}) applied", job, pending.description);
        Some(JobOutcome::Applied { job, rect: region })
    }

    /// The target exists, is still paintable, and its pixels under `region`
    /// are what the job read.
    fn still_valid(stack: &LayerStack, pending: &PendingJob, region: PixelRect) -> bool {
        if stack.check_paintable(pending.target).is_err() {
            return false;
        }
        let Some(current) = stack.buffer_target(pending.target) else { return false };
        current.rect() == pending.snapshot.rect()
            && current.copy_region(region).raw() == pending.snapshot.copy_region(region).raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{BufferBacked, Layer};
    use crate::ops::filters::{GaussianBlur, Invert};

    struct Exploding;

    impl Filter for Exploding {
        fn name(&self) -> &str {
            "Exploding"
        }
        fn params(&self) -> Vec<crate::ops::filters::ParamSpec> {
            Vec::new()
        }
        fn apply(&self, _src: &PixelBuffer, _params: &[ParamValue]) -> Result<PixelBuffer, FilterError> {
            panic!("kaboom")
        }
    }

    fn red_stack() -> (LayerStack, History, crate::layer::LayerId) {
        let mut stack = LayerStack::new(8, 8);
        let mut h = History::default();
        let id = stack.add_layer(Layer::new_image("l", PixelBuffer::filled(8, 8, [255, 0, 0, 255])), None, 0, &mut h);
        (stack, h, id)
    }

    #[test]
    fn finished_job_is_applied_with_undo() {
        let (mut stack, mut h, id) = red_stack();
        let mut worker = FilterWorker::new();
        let before = h.undo_count();
        worker.submit(&stack, BufferTarget::Layer(id), Arc::new(Invert), vec![]).unwrap();
        let outcomes = worker.wait(&mut stack, &mut h);
        assert!(matches!(outcomes[..], [JobOutcome::Applied { .. }]));
        assert_eq!(h.undo_count(), before + 1);
        let px = stack.find(id).unwrap().as_image().unwrap().buffer().pixel(3, 3);
        assert_eq!(px, [0, 255, 255, 255]);
    }

    #[test]
    fn result_for_removed_layer_is_discarded() {
        let (mut stack, mut h, id) = red_stack();
        let mut worker = FilterWorker::new();
        worker.submit(&stack, BufferTarget::Layer(id), Arc::new(Invert), vec![]).unwrap();
        stack.remove_layer(id, &mut h);
        let outcomes = worker.wait(&mut stack, &mut h);
        assert!(matches!(outcomes[..], [JobOutcome::Discarded { .. }]));
    }

    #[test]
    fn result_for_repainted_layer_is_discarded() {
        let (mut stack, mut h, id) = red_stack();
        let mut worker = FilterWorker::new();
        worker
            .submit(&stack, BufferTarget::Layer(id), Arc::new(GaussianBlur), vec![ParamValue::Float(1.0)])
            .unwrap();
        if let Some(buf) = stack.buffer_target_mut(BufferTarget::Layer(id)) {
            buf.put_pixel(0, 0, [0, 0, 0, 255]);
        }
        let outcomes = worker.wait(&mut stack, &mut h);
        assert!(matches!(outcomes[..], [JobOutcome::Discarded { .. }]));
    }

    #[test]
    fn panicking_filter_reports_failure() {
        let (mut stack, mut h, id) = red_stack();
        let mut worker = FilterWorker::new();
        worker.submit(&stack, BufferTarget::Layer(id), Arc::new(Exploding), vec![]).unwrap();
        let outcomes = worker.wait(&mut stack, &mut h);
        match &outcomes[..] {
            [JobOutcome::Failed { error: FilterError::Panicked(name, msg), .. }] => {
                assert_eq!(name, "Exploding");
                assert!(msg.contains("kaboom"));
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
        let px = stack.find(id).unwrap().as_image().unwrap().buffer().pixel(0, 0);
        assert_eq!(px, [255, 0, 0, 255]);
    }

    #[test]
    fn bad_parameters_fail_at_submit() {
        let (stack, _h, id) = red_stack();
        let mut worker = FilterWorker::new();
        let err = worker.submit(&stack, BufferTarget::Layer(id), Arc::new(GaussianBlur), vec![]).unwrap_err();
        assert!(matches!(err, FilterError::BadParameters(_)));
        assert_eq!(worker.pending_jobs(), 0);
    }

    #[test]
    fn cancelled_job_is_silently_dropped() {
        let (mut stack, mut h, id) = red_stack();
        let mut worker = FilterWorker::new();
        let job = worker.submit(&stack, BufferTarget::Layer(id), Arc::new(Invert), vec![]).unwrap();
        worker.cancel(job);
        assert!(worker.wait(&mut stack, &mut h).is_empty());
        let px = stack.find(id).unwrap().as_image().unwrap().buffer().pixel(0, 0);
        assert_eq!(px, [255, 0, 0, 255]);
    }
}
