//! Benchmarks for n-gram extraction and index evaluation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use deepstacks::catalog::Media;
use deepstacks::index::SearchIndex;
use deepstacks::ngram;
use deepstacks::query::rank::common_substring_len;

fn sample_index() -> SearchIndex {
    let index = SearchIndex::new();
    let titles = [
        "Quantum Garden",
        "Garden of Forking Paths",
        "Quantum Mechanics",
        "The Gray Fox",
        "Café Noir",
        "A Brief History of Shelving",
    ];
    for id in 0..10_000u32 {
        let media = Media {
            id,
            title: format!("{} vol {}", titles[id as usize % titles.len()], id),
            publisher: "Vulpine Press".into(),
            publisher_id: 901,
            ..Default::default()
        };
        index.index_media(&media);
    }
    index.finalize();
    index
}

fn bench_ngrams(c: &mut Criterion) {
    c.bench_function("ngrams_title", |b| {
        b.iter(|| black_box(ngram::ngrams(" the quantum garden of forking paths ")))
    });
}

fn bench_fold(c: &mut Criterion) {
    c.bench_function("fold_diacritics", |b| {
        b.iter(|| black_box(ngram::fold("Élève Café Größe naïveté")))
    });
}

fn bench_search(c: &mut Criterion) {
    let index = sample_index();
    c.bench_function("search_two_words_10k", |b| {
        b.iter(|| black_box(index.search("quantum garden")))
    });
    c.bench_function("search_miss_10k", |b| {
        b.iter(|| black_box(index.search("zzzyx")))
    });
}

fn bench_rank(c: &mut Criterion) {
    c.bench_function("common_substring_len", |b| {
        b.iter(|| {
            black_box(common_substring_len(
                "quantum garden",
                "garden of forking paths vulpine press ana",
            ))
        })
    });
}

criterion_group!(benches, bench_ngrams, bench_fold, bench_search, bench_rank);
criterion_main!(benches);
