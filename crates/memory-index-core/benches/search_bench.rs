use criterion::{criterion_group, criterion_main, Criterion};
use memory_index_core::{
    normalize_tags, AccessInfo, BaseStatus, LogEntry, MemoryRecord, MergedView, PendingEntry,
    RankingWeights, RecordId, RecordKind, Scope, SearchQuery,
};
use time::{Duration, OffsetDateTime};

fn mk_record(index: usize) -> MemoryRecord {
    let kind = match index % 4 {
        0 => RecordKind::Note,
        1 => RecordKind::Decision,
        2 => RecordKind::Implementation,
        _ => RecordKind::Pattern,
    };
    let title = match index % 3 {
        0 => format!("OAuth token refresh {index}"),
        1 => format!("Database pool tuning {index}"),
        _ => format!("Release checklist {index}"),
    };

    let id = RecordId::generate(kind);
    let mut record = MemoryRecord::new(id, kind, Scope::Shared, title, OffsetDateTime::UNIX_EPOCH);
    record.summary = "bench fixture summary mentioning tokens and pools".to_string();
    record.keywords = vec!["oauth".to_string(), "database".to_string()];
    record.triggers = vec!["auth".to_string()];
    record.tags = normalize_tags(["bench", if index % 2 == 0 { "even" } else { "odd" }]);
    record
}

fn bench_search(c: &mut Criterion) {
    let view = MergedView::from_base(
        BaseStatus::Loaded,
        None,
        (0..1_000).map(mk_record).collect::<Vec<_>>(),
    );
    let query = SearchQuery::new("oauth token", OffsetDateTime::UNIX_EPOCH + Duration::days(3));
    let weights = RankingWeights::default();

    c.bench_function("search_1000_records", |b| {
        b.iter(|| {
            if let Err(err) = view.search(&query, &weights) {
                panic!("search benchmark failed: {err}");
            }
        });
    });
}

fn bench_replay(c: &mut Criterion) {
    let records = (0..200).map(mk_record).collect::<Vec<_>>();
    let mut entries = Vec::new();
    for (index, record) in records.iter().enumerate() {
        let offset = i64::try_from(index).unwrap_or(0);
        let at = OffsetDateTime::UNIX_EPOCH + Duration::seconds(offset);
        entries.push(PendingEntry {
            entry_id: format!("add-{index:05}"),
            entry: LogEntry::add(record.clone(), "bench", at),
        });
        let mut access = AccessInfo::default();
        access.record(at, Some("oauth"));
        entries.push(PendingEntry {
            entry_id: format!("access-{index:05}"),
            entry: LogEntry::access(record.id.clone(), access, "bench", at),
        });
    }

    c.bench_function("replay_400_entries", |b| {
        b.iter(|| {
            let mut view = MergedView::from_base(BaseStatus::Missing, None, Vec::new());
            view.replay(entries.clone());
            assert_eq!(view.len(), records.len());
        });
    });
}

criterion_group!(search_benches, bench_search, bench_replay);
criterion_main!(search_benches);
