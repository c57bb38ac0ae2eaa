//! Scoring throughput for a mixed inbox.
//!
//! Scoring runs on every inbound message and again whenever a profile
//! changes, so it has to stay well under a millisecond per message.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use herald_core::config::PriorityConfig;
use herald_core::types::{Message, SenderProfile, Timestamp};
use herald_priority::{PriorityEngine, UrgencyAnalyzer};

fn inbox(now: Timestamp) -> Vec<Message> {
    let bodies = [
        "Lunch on Friday? Let me know what works for you.",
        "URGENT: production is down, need a fix ASAP!!",
        "Invoice 2231 attached, payment due tomorrow.",
        "Thanks for the great demo today, the team loved it.",
        "Reminder: contract review meeting this week, important.",
    ];
    (0..100)
        .map(|i| {
            Message::new(
                format!("sender-{}@example.com", i % 7),
                bodies[i % bodies.len()],
                Timestamp(now.0 - (i as i64) * 60),
            )
            .with_subject(format!("Thread {}", i))
        })
        .collect()
}

fn bench_score(c: &mut Criterion) {
    let engine = PriorityEngine::new(&PriorityConfig::default(), 5);
    let now = Timestamp(1_700_000_000);
    let messages = inbox(now);
    let mut profile = SenderProfile::new("sender-0@example.com", Timestamp(0));
    profile.replies = 8;
    profile.set_weight(72.0);

    c.bench_function("score_100_messages", |b| {
        b.iter(|| {
            for msg in &messages {
                black_box(engine.score(black_box(msg), Some(&profile), now));
            }
        })
    });
}

fn bench_urgency(c: &mut Criterion) {
    let analyzer = UrgencyAnalyzer::new();
    let text = "URGENT: the deploy FAILED again and customers are complaining, \
                please look at this immediately!! Critical for today's release.";
    c.bench_function("urgency_analysis", |b| b.iter(|| black_box(analyzer.analyze(black_box(text)))));
}

criterion_group!(benches, bench_score, bench_urgency);
criterion_main!(benches);
