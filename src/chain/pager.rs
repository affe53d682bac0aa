//! Restartable iteration over paginated incoming transfers

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ChainConnector, IncomingTransfer};
use crate::error::ConnectorError;

/// Opaque position inside a paginated transfer listing
///
/// Connectors hand one out with every page that has a successor; passing it back
/// resumes the listing right after that page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub String);

/// One page returned by [`ChainConnector::incoming_transfers_page`]
#[derive(Debug, Clone, Default)]
pub struct TransferPage {
    pub transfers: Vec<IncomingTransfer>,
    pub next: Option<PageCursor>,
}

enum PagerState {
    Start(Option<PageCursor>),
    Buffered {
        transfers: std::vec::IntoIter<IncomingTransfer>,
        next: Option<PageCursor>,
    },
    Done,
}

/// Lazily stream all transfers into `address` within `[start_height, end_height)`
///
/// Each item carries the cursor of the page it came from, so a consumer that stops
/// half way can restart with `resume_from` set to the last cursor it saw.
pub fn incoming_transfers_from(
    connector: Arc<dyn ChainConnector>,
    address: String,
    start_height: u64,
    end_height: u64,
    resume_from: Option<PageCursor>,
) -> impl Stream<Item = Result<(Option<PageCursor>, IncomingTransfer), ConnectorError>> {
    stream::try_unfold(
        (PagerState::Start(resume_from), None::<PageCursor>),
        move |(mut state, mut current)| {
            let connector = Arc::clone(&connector);
            let address = address.clone();
            async move {
                loop {
                    match state {
                        PagerState::Done => return Ok(None),
                        PagerState::Buffered {
                            mut transfers,
                            next,
                        } => {
                            if let Some(transfer) = transfers.next() {
                                let item = (current.clone(), transfer);
                                return Ok(Some((
                                    item,
                                    (PagerState::Buffered { transfers, next }, current),
                                )));
                            }
                            state = match next {
                                Some(cursor) => PagerState::Start(Some(cursor)),
                                None => PagerState::Done,
                            };
                        }
                        PagerState::Start(cursor) => {
                            let page = connector
                                .incoming_transfers_page(
                                    &address,
                                    start_height,
                                    end_height,
                                    cursor.as_ref(),
                                )
                                .await?;
                            current = cursor;
                            state = PagerState::Buffered {
                                transfers: page.transfers.into_iter(),
                                next: page.next,
                            };
                        }
                    }
                }
            }
        },
    )
}
