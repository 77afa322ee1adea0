// Copyright 2021 Datafuse Labs
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

use crate::{
    error::StorageError,
    labels::LabelSet,
    tsdb::{TsdbSeries, TsdbSeriesIterator, TsdbSeriesSet},
};

/// Cursor over series handed to the frontend.
pub trait SeriesSet: Send {
    fn next(&mut self) -> bool;
    fn at(&self) -> Box<dyn Series>;
    fn err(&self) -> Option<StorageError>;
}

pub trait Series: Send {
    fn labels(&self) -> LabelSet;
    fn iterator(&self) -> Box<dyn SeriesIterator>;
}

pub trait SeriesIterator: Send {
    /// Advances to the first sample at or after `t`.
    fn seek(&mut self, t: i64) -> bool;
    fn next(&mut self) -> bool;
    fn at(&self) -> (i64, f64);
    fn err(&self) -> Option<StorageError>;
}

/// Engine result cursor exposed as a frontend series set.
pub struct PromSeriesSet {
    inner: Box<dyn TsdbSeriesSet>,
}

impl PromSeriesSet {
    pub fn new(inner: Box<dyn TsdbSeriesSet>) -> Self {
        Self { inner }
    }
}

impl SeriesSet for PromSeriesSet {
    fn next(&mut self) -> bool {
        self.inner.next()
    }

    fn at(&self) -> Box<dyn Series> {
        Box::new(PromSeries {
            inner: self.inner.at(),
        })
    }

    fn err(&self) -> Option<StorageError> {
        self.inner.err().cloned().map(StorageError::from)
    }
}

pub struct PromSeries {
    inner: Box<dyn TsdbSeries>,
}

impl Series for PromSeries {
    fn labels(&self) -> LabelSet {
        self.inner.labels()
    }

    fn iterator(&self) -> Box<dyn SeriesIterator> {
        Box::new(PromSeriesIterator {
            inner: self.inner.iterator(),
        })
    }
}

pub struct PromSeriesIterator {
    inner: Box<dyn TsdbSeriesIterator>,
}

impl SeriesIterator for PromSeriesIterator {
    fn seek(&mut self, t: i64) -> bool {
        self.inner.seek(t)
    }

    fn next(&mut self) -> bool {
        self.inner.next()
    }

    fn at(&self) -> (i64, f64) {
        self.inner.at()
    }

    fn err(&self) -> Option<StorageError> {
        self.inner.err().cloned().map(StorageError::from)
    }
}

/// Series set over label sets only; every series has no samples.
pub struct MetadataSeriesSet {
    labels: Vec<LabelSet>,
    current: Option<usize>,
}

impl MetadataSeriesSet {
    pub fn new(labels: Vec<LabelSet>) -> Self {
        Self {
            labels,
            current: None,
        }
    }
}

impl SeriesSet for MetadataSeriesSet {
    fn next(&mut self) -> bool {
        let next = self.current.map_or(0, |idx| idx.saturating_add(1));
        self.current = Some(next);
        next < self.labels.len()
    }

    fn at(&self) -> Box<dyn Series> {
        let labels = self
            .current
            .and_then(|idx| self.labels.get(idx))
            .cloned()
            .unwrap_or_default();
        Box::new(MetadataSeries { labels })
    }

    fn err(&self) -> Option<StorageError> {
        None
    }
}

pub struct MetadataSeries {
    labels: LabelSet,
}

impl MetadataSeries {
    pub fn key(&self) -> u64 {
        self.labels.hash()
    }
}

impl Series for MetadataSeries {
    fn labels(&self) -> LabelSet {
        self.labels.clone()
    }

    fn iterator(&self) -> Box<dyn SeriesIterator> {
        Box::new(EmptySeriesIterator)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySeriesIterator;

impl SeriesIterator for EmptySeriesIterator {
    fn seek(&mut self, _t: i64) -> bool {
        false
    }

    fn next(&mut self) -> bool {
        false
    }

    fn at(&self) -> (i64, f64) {
        (0, f64::NAN)
    }

    fn err(&self) -> Option<StorageError> {
        None
    }
}
