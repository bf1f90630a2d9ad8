use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;

use crate::core::ProgressReporter;

pin_project! {
    /// 包装请求体，统计已发送字节
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        reporter: ProgressReporter,
        finished: bool,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, reporter: ProgressReporter) -> Self {
        Self {
            inner,
            reporter,
            finished: false,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    this.reporter.advance(chunk.len() as u64);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                // 流结束时发送最终进度
                if !*this.finished {
                    *this.finished = true;
                    this.reporter.finish();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
