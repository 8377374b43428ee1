use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use dimr::activity::{Activity, Lifecycle, StepOutcome};
use dimr::composite::{CompositeActivity, ExecutionMode, drive};
use dimr::model::{ModelDefinition, ModelHandle};
use dimr::time::{TimeSynchronizer, TimeWindow};

struct Counter {
    lifecycle: Lifecycle,
    steps: u32,
    taken: u32,
}

impl Counter {
    fn new(name: String, steps: u32) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            steps,
            taken: 0,
        }
    }
}

impl Activity for Counter {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn on_initialize(&mut self) -> dimr::Result<()> {
        self.taken = 0;
        Ok(())
    }

    fn on_execute(&mut self) -> dimr::Result<StepOutcome> {
        self.taken += 1;
        if self.taken >= self.steps {
            Ok(StepOutcome::Done)
        } else {
            Ok(StepOutcome::Continue)
        }
    }

    fn on_finish(&mut self) -> dimr::Result<()> {
        Ok(())
    }
}

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap()
}

fn composite(mode: ExecutionMode, children: usize, steps: u32) -> CompositeActivity {
    let mut composite = CompositeActivity::new("bench", mode);
    for index in 0..children {
        composite
            .add_activity(Box::new(Counter::new(format!("model-{index}"), steps)))
            .unwrap();
    }
    composite
}

fn bench_sequential(c: &mut Criterion) {
    c.bench_function("sequential_16x100", |b| {
        b.iter_batched(
            || composite(ExecutionMode::Sequential, 16, 100),
            |mut composite| drive(&mut composite),
            BatchSize::SmallInput,
        )
    });
}

fn bench_parallel(c: &mut Criterion) {
    c.bench_function("parallel_8x100", |b| {
        b.iter_batched(
            || composite(ExecutionMode::Parallel, 8, 100),
            |mut composite| drive(&mut composite),
            BatchSize::SmallInput,
        )
    });
}

fn bench_sync_pass(c: &mut Criterion) {
    c.bench_function("sync_pass_64_models", |b| {
        let window = TimeWindow::new(start(), start() + TimeDelta::days(1), TimeDelta::hours(1));
        let mut sync = TimeSynchronizer::new(window.clone());
        for index in 0..64 {
            let follows = index % 2 == 0;
            let model = ModelDefinition::new(format!("model-{index}"), "flow")
                .with_time(window.clone().with_overrides(follows, follows, follows));
            sync.add_child(ModelHandle::new(model));
        }

        let mut hours = 0;
        b.iter(|| {
            hours = (hours + 1) % 12;
            sync.set_stop_time(start() + TimeDelta::days(1) + TimeDelta::hours(hours));
        });
    });
}

criterion_group!(benches, bench_sequential, bench_parallel, bench_sync_pass);
criterion_main!(benches);
