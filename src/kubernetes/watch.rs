//! Watches a resource collection continuously and surfaces it as a stream
//! of cache events, relisting whenever the watch desyncs.

use std::collections::VecDeque;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use super::client::{Client, Error, WatchEvent};
use super::resource::Resource;

/// Events emitted by [`watcher`].
///
/// A consumer sees `Init`, a run of `InitApply`, then `InitDone` whenever
/// the underlying source (re)lists, and plain `Apply`/`Delete` events in
/// between. A relist implies that every object not listed again has been
/// deleted.
pub enum Event<R> {
    Init,
    InitApply(R),
    InitDone,
    Apply(R),
    Delete(R),
}

enum State<R: Resource> {
    Start,
    Draining {
        objects: VecDeque<R>,
        resource_version: String,
    },
    StartWatch {
        resource_version: String,
    },
    Watching {
        resource_version: String,
        stream: BoxStream<'static, Result<WatchEvent<R>, Error>>,
    },
}

/// Watch `R` for changes, recovering the stream on errors. Errors are
/// surfaced inline so the consumer can decide how loudly to complain and
/// how long to back off.
pub fn watcher<R: Resource>(
    client: Client,
    namespace: Option<String>,
) -> impl Stream<Item = Result<Event<R>, Error>> {
    futures::stream::unfold(
        (client, namespace, State::Start),
        |(client, namespace, mut state)| async {
            loop {
                let (result, next) = step(&client, namespace.as_deref(), state).await;
                state = next;

                if let Some(result) = result {
                    return Some((result, (client, namespace, state)));
                }
            }
        },
    )
}

async fn step<R: Resource>(
    client: &Client,
    namespace: Option<&str>,
    state: State<R>,
) -> (Option<Result<Event<R>, Error>>, State<R>) {
    match state {
        State::Start => match client.list::<R>(namespace).await {
            Ok(list) => {
                let resource_version = list
                    .metadata
                    .resource_version
                    .unwrap_or_else(|| "0".to_string());

                (
                    Some(Ok(Event::Init)),
                    State::Draining {
                        objects: VecDeque::from(list.items),
                        resource_version,
                    },
                )
            }
            Err(err) => (Some(Err(err)), State::Start),
        },

        State::Draining {
            mut objects,
            resource_version,
        } => match objects.pop_front() {
            Some(obj) => (
                Some(Ok(Event::InitApply(obj))),
                State::Draining {
                    objects,
                    resource_version,
                },
            ),
            None => (
                Some(Ok(Event::InitDone)),
                State::StartWatch { resource_version },
            ),
        },

        State::StartWatch { resource_version } => {
            match client.watch::<R>(namespace, &resource_version).await {
                Ok(stream) => (
                    None,
                    State::Watching {
                        resource_version,
                        stream,
                    },
                ),
                Err(err) => (Some(Err(err)), State::StartWatch { resource_version }),
            }
        }

        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(event)) => match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                    let resource_version = version_of(&obj, resource_version);
                    (
                        Some(Ok(Event::Apply(obj))),
                        State::Watching {
                            resource_version,
                            stream,
                        },
                    )
                }
                WatchEvent::Deleted(obj) => {
                    let resource_version = version_of(&obj, resource_version);
                    (
                        Some(Ok(Event::Delete(obj))),
                        State::Watching {
                            resource_version,
                            stream,
                        },
                    )
                }
                WatchEvent::Bookmark(bookmark) => (
                    None,
                    State::Watching {
                        resource_version: bookmark.metadata.resource_version,
                        stream,
                    },
                ),
                WatchEvent::Error(resp) => {
                    // HTTP GONE means the version we watch from has been
                    // compacted away and a full relist is required.
                    let next = if resp.code == 410 {
                        State::Start
                    } else {
                        State::Watching {
                            resource_version,
                            stream,
                        }
                    };

                    (Some(Err(Error::Api(resp))), next)
                }
            },

            // A read error desyncs us from the version sequence, relist.
            Some(Err(err)) => (Some(Err(err)), State::Start),

            // Server-side watch expiry, resume from the last version seen.
            None => (None, State::StartWatch { resource_version }),
        },
    }
}

fn version_of<R: Resource>(obj: &R, fallback: String) -> String {
    obj.metadata()
        .resource_version
        .clone()
        .unwrap_or(fallback)
}
