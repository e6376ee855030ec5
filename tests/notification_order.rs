use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Local;

use watchpost::{
    CameraConfig, CameraLink, CapturedImage, Channel, DetectionKind, Frame,
    NotificationDispatcher, NotificationTask,
};

struct Recording {
    name: &'static str,
    seen: Arc<Mutex<Vec<(String, u64)>>>,
    fail_every: Option<u64>,
}

impl Channel for Recording {
    fn name(&self) -> &str {
        self.name
    }

    fn send(&mut self, task: &NotificationTask) -> Result<()> {
        let seq = task.frame().seq();
        if self.fail_every.is_some_and(|n| seq % n == 0) {
            return Err(anyhow!("upstream 502"));
        }
        self.seen
            .lock()
            .unwrap()
            .push((task.camera().name.clone(), seq));
        Ok(())
    }
}

fn task(camera: &Arc<CameraConfig>, seq: u64) -> NotificationTask {
    let frame = Frame::new(
        camera.name.as_str(),
        seq,
        CapturedImage::new(1, 1, vec![0, 0, 0]),
    );
    NotificationTask::new(Local::now(), DetectionKind::Human, camera.clone(), frame)
}

#[test]
fn every_channel_sees_the_same_global_order() -> Result<()> {
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = NotificationDispatcher::start(vec![
        Box::new(Recording {
            name: "first",
            seen: first.clone(),
            fail_every: None,
        }),
        Box::new(Recording {
            name: "second",
            seen: second.clone(),
            fail_every: None,
        }),
    ])?;

    let producers: Vec<_> = ["Gate", "Porch", "Yard"]
        .into_iter()
        .map(|name| {
            let sender = dispatcher.sender();
            let camera = Arc::new(CameraConfig::with_link(
                name,
                CameraLink::Uri(format!("stub://{name}")),
            ));
            std::thread::spawn(move || {
                for seq in 1..=50 {
                    sender.enqueue(task(&camera, seq)).expect("accepting");
                    if seq % 10 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }

    let stats = dispatcher.stop();
    assert_eq!(stats.enqueued, 150);
    assert_eq!(stats.completed, 150);
    assert_eq!(stats.delivered, 300);

    let first = first.lock().unwrap().clone();
    let second = second.lock().unwrap().clone();
    assert_eq!(first.len(), 150);
    assert_eq!(first, second);
    for name in ["Gate", "Porch", "Yard"] {
        let seqs: Vec<u64> = first
            .iter()
            .filter(|(camera, _)| camera == name)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>(), "per-producer FIFO for {name}");
    }
    Ok(())
}

#[test]
fn failures_on_one_channel_do_not_reorder_or_block_the_other() -> Result<()> {
    let flaky = Arc::new(Mutex::new(Vec::new()));
    let steady = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = NotificationDispatcher::start(vec![
        Box::new(Recording {
            name: "flaky",
            seen: flaky.clone(),
            fail_every: Some(3),
        }),
        Box::new(Recording {
            name: "steady",
            seen: steady.clone(),
            fail_every: None,
        }),
    ])?;

    let camera = Arc::new(CameraConfig::with_link("Gate", CameraLink::Index(0)));
    for seq in 1..=9 {
        dispatcher.enqueue(task(&camera, seq))?;
    }
    let stats = dispatcher.stop();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.delivered, 15);

    let steady: Vec<u64> = steady.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(steady, (1..=9).collect::<Vec<_>>());
    let flaky: Vec<u64> = flaky.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(flaky, vec![1, 2, 4, 5, 7, 8]);
    Ok(())
}
