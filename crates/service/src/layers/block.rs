//! Blockwise transfers (RFC 7959), hidden from both sides of the stack.
//!
//! Four LFU tables parametrise four flows: receiving a chunked request
//! body and serving a chunked response body on the server side, sending a
//! chunked request body and reassembling a chunked response body on the
//! client side. Every entry records the last byte offset, the running
//! block number, the M bit, the negotiated size and the accumulated
//! payload.
//!
//! Worst case per table is TRANSACTION_LIST_MAX_SIZE entries of
//! MAX_PAYLOAD-sized slices being accumulated, about one MiB plus the
//! bodies in flight; the LFU bound is what keeps an adversarial peer from
//! growing the tables without limit.

use crate::{
    Error, Related,
    cache::LfuCache,
    params::{MAX_PAYLOAD, TRANSACTION_LIST_MAX_SIZE},
    transaction::{TokenKey, Transaction},
};

use std::sync::Arc;

use codec::{BlockValue, Code, ContentFormat, Message};
use parking_lot::Mutex;

struct BlockItem {
    /// Last byte offset exchanged.
    byte: usize,
    num: u32,
    more: bool,
    size: u16,
    payload: Vec<u8>,
    content_type: Option<ContentFormat>,
}

pub struct BlockLayer {
    block1_sent: Mutex<LfuCache<TokenKey, BlockItem>>,
    block2_sent: Mutex<LfuCache<TokenKey, BlockItem>>,
    block1_received: Mutex<LfuCache<TokenKey, BlockItem>>,
    block2_received: Mutex<LfuCache<TokenKey, BlockItem>>,
}

impl Default for BlockLayer {
    fn default() -> Self {
        Self {
            block1_sent: Mutex::new(LfuCache::new(TRANSACTION_LIST_MAX_SIZE)),
            block2_sent: Mutex::new(LfuCache::new(TRANSACTION_LIST_MAX_SIZE)),
            block1_received: Mutex::new(LfuCache::new(TRANSACTION_LIST_MAX_SIZE)),
            block2_received: Mutex::new(LfuCache::new(TRANSACTION_LIST_MAX_SIZE)),
        }
    }
}

impl BlockLayer {
    /// Server side, inbound pass.
    ///
    /// A Block2 option records the client's early negotiation. A Block1
    /// option (or an oversized body) accumulates the request payload; as
    /// long as more blocks are expected the transaction short-circuits
    /// with 2.31 Continue and the request layer is not reached.
    pub fn receive_request(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let mut state = transaction.lock();
        let source = state
            .request
            .source
            .ok_or_else(|| Error::silent("request source cannot be computed"))?;
        let key = TokenKey::new(source, &state.request.token);

        if let Some(block2) = state.request.block2() {
            let mut cache = self.block2_received.lock();
            if let Some(item) = cache.get_mut(&key) {
                item.num = block2.num;
                item.size = block2.size;
                item.more = block2.more;
            } else {
                // early negotiation
                cache.insert(
                    key,
                    BlockItem {
                        byte: block2.offset(),
                        num: block2.num,
                        more: block2.more,
                        size: block2.size,
                        payload: Vec::new(),
                        content_type: None,
                    },
                );
            }

            return Ok(());
        }

        if state.request.block1().is_none() && state.request.payload.len() <= MAX_PAYLOAD {
            return Ok(());
        }

        let (num, more, size) = if state.request.payload.len() > MAX_PAYLOAD {
            state.request.payload.truncate(MAX_PAYLOAD);
            (0, true, MAX_PAYLOAD as u16)
        } else {
            let block1 = state.request.block1().unwrap();
            (block1.num, block1.more, block1.size)
        };

        let content_type = state.request.content_format();
        let mut cache = self.block1_received.lock();

        if cache.contains(&key) {
            let item = cache.get_mut(&key).unwrap();
            if num != item.num || content_type != item.content_type || state.request.payload.is_empty()
            {
                cache.remove(&key);
                drop(cache);
                drop(state);
                return Err(Error::internal(
                    "entity incomplete",
                    Code::RequestEntityIncomplete,
                    Some(transaction.clone()),
                    Related::Request,
                ));
            }

            let payload = state.request.payload.clone();
            item.payload.extend_from_slice(&payload);
        } else {
            if num != 0 {
                drop(cache);
                drop(state);
                return Err(Error::internal(
                    "entity incomplete",
                    Code::RequestEntityIncomplete,
                    Some(transaction.clone()),
                    Related::Request,
                ));
            }

            cache.insert(
                key.clone(),
                BlockItem {
                    byte: size as usize,
                    num,
                    more,
                    size,
                    payload: state.request.payload.clone(),
                    content_type,
                },
            );
        }

        let item = cache.get_mut(&key).unwrap();
        item.num = num + 1;
        item.byte = size as usize;
        item.size = size;
        item.more = more;

        if more {
            // 2.31 Continue; the outbound pass attaches the Block1 echo
            state.block_transfer = true;
            state.response = Some(Message::response_to(&state.request));
        } else {
            state.request.payload = item.payload.clone();
            state.block_transfer = false;
        }

        Ok(())
    }

    /// Server side, outbound pass: slice an oversized (or negotiated)
    /// response body, or acknowledge the Block1 sequence in progress.
    pub fn send_response(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let mut state = transaction.lock();
        let source = state
            .request
            .source
            .ok_or_else(|| Error::silent("request source cannot be computed"))?;
        let key = TokenKey::new(source, &state.request.token);

        let payload_len = state
            .response
            .as_ref()
            .map(|r| r.payload.len())
            .unwrap_or(0);

        let mut block2 = self.block2_received.lock();
        if (block2.contains(&key) && payload_len > 0) || payload_len > MAX_PAYLOAD {
            let (byte, num, size) = match block2.get(&key) {
                Some(item) => (item.byte, item.num, item.size),
                None => {
                    block2.insert(
                        key.clone(),
                        BlockItem {
                            byte: 0,
                            num: 0,
                            more: true,
                            size: MAX_PAYLOAD as u16,
                            payload: Vec::new(),
                            content_type: None,
                        },
                    );

                    (0, 0, MAX_PAYLOAD as u16)
                }
            };

            let response = state
                .response
                .as_mut()
                .ok_or_else(|| Error::silent("transaction has no response"))?;

            // Beyond the first block the notification ordering would be
            // meaningless (RFC 7959, section 2.4).
            if num != 0 {
                response.clear_observe();
            }

            let more = response.payload.len() > byte + size as usize;
            let start = byte.min(response.payload.len());
            let end = (byte + size as usize).min(response.payload.len());
            response.payload = response.payload[start..end].to_vec();
            response.set_block2(BlockValue::new(num, more, size).map_err(Error::from)?);

            let item = block2.get_mut(&key).unwrap();
            item.byte += size as usize;
            item.num += 1;
            if !more {
                block2.remove(&key);
            }

            return Ok(());
        }

        drop(block2);

        let mut block1 = self.block1_received.lock();
        if let Some(item) = block1.get(&key) {
            let (num, more, size) = (item.num, item.more, item.size);
            let response = state
                .response
                .as_mut()
                .ok_or_else(|| Error::silent("transaction has no response"))?;

            response.set_block1(BlockValue::new(num - 1, more, size).map_err(Error::from)?);
            if more {
                response.code = Code::Continue;
            } else {
                block1.remove(&key);
            }
        }

        Ok(())
    }

    /// Client side, outbound pass: stash an oversized request body and
    /// send the first slice, or remember an early Block2 negotiation.
    pub fn send_request(&self, request: &mut Message) -> Result<(), Error> {
        if request.block1().is_some() || request.payload.len() > MAX_PAYLOAD {
            let destination = request
                .destination
                .ok_or_else(|| Error::silent("request destination cannot be computed"))?;
            let key = TokenKey::new(destination, &request.token);

            let block1 = match request.block1() {
                Some(block1) => block1,
                None => {
                    let block1 = BlockValue::new(0, true, MAX_PAYLOAD as u16).map_err(Error::from)?;
                    request.set_block1(block1);
                    block1
                }
            };

            self.block1_sent.lock().insert(
                key,
                BlockItem {
                    byte: block1.size as usize,
                    num: block1.num,
                    more: block1.more,
                    size: block1.size,
                    payload: request.payload.clone(),
                    content_type: request.content_format(),
                },
            );

            request.payload.truncate(block1.size as usize);
        } else if let Some(block2) = request.block2() {
            let destination = request
                .destination
                .ok_or_else(|| Error::silent("request destination cannot be computed"))?;
            let key = TokenKey::new(destination, &request.token);

            self.block2_sent.lock().insert(
                key,
                BlockItem {
                    byte: block2.size as usize,
                    num: block2.num,
                    more: block2.more,
                    size: block2.size,
                    payload: Vec::new(),
                    content_type: None,
                },
            );
        }

        Ok(())
    }

    /// Client side, inbound pass: track Block1 acknowledgements (honouring
    /// a server that scaled the size down) and reassemble Block2 bodies.
    pub fn receive_response(&self, transaction: &Arc<Transaction>) -> Result<(), Error> {
        let mut state = transaction.lock();
        let response = state
            .response
            .as_mut()
            .ok_or_else(|| Error::silent("transaction has no response"))?;
        let source = response
            .source
            .ok_or_else(|| Error::silent("response source cannot be computed"))?;
        let key = TokenKey::new(source, &response.token);

        let response_block1 = response.block1();
        let response_block2 = response.block2();
        let content_type = response.content_format();
        let payload = response.payload.clone();
        drop(state);

        let mut block1 = self.block1_sent.lock();
        if block1.contains(&key) && response_block1.is_some() {
            let item = block1.get_mut(&key).unwrap();
            let acked = response_block1.unwrap();
            if acked.num != item.num {
                return Err(Error::internal(
                    format!(
                        "block num acknowledged error, expected {} received {}",
                        item.num, acked.num
                    ),
                    Code::RequestEntityIncomplete,
                    Some(transaction.clone()),
                    Related::Response,
                ));
            }

            if acked.size < item.size {
                log::debug!("scale down block size, was {} become {}", item.size, acked.size);
                item.size = acked.size;
            }

            return Ok(());
        }

        drop(block1);

        if let Some(block) = response_block2 {
            let mut block2 = self.block2_sent.lock();
            if block.more {
                if let Some(item) = block2.get_mut(&key) {
                    if block.num != item.num {
                        return Err(Error::internal(
                            "receive unwanted block",
                            Code::RequestEntityIncomplete,
                            Some(transaction.clone()),
                            Related::Response,
                        ));
                    }

                    if item.content_type.is_none() {
                        item.content_type = content_type;
                    }

                    if item.content_type != content_type {
                        return Err(Error::internal(
                            "content-type error",
                            Code::UnsupportedContentFormat,
                            Some(transaction.clone()),
                            Related::Response,
                        ));
                    }

                    item.byte += block.size as usize;
                    item.num = block.num + 1;
                    item.size = block.size;
                    item.more = block.more;
                    item.payload.extend_from_slice(&payload);
                } else {
                    block2.insert(
                        key,
                        BlockItem {
                            byte: block.size as usize,
                            num: block.num + 1,
                            more: block.more,
                            size: block.size,
                            payload,
                            content_type,
                        },
                    );
                }
            } else if block2.contains(&key) {
                let item = block2.get_mut(&key).unwrap();
                if item.content_type.is_none() {
                    item.content_type = content_type;
                }

                if item.content_type != content_type {
                    return Err(Error::internal(
                        "content-type error",
                        Code::UnsupportedContentFormat,
                        Some(transaction.clone()),
                        Related::Response,
                    ));
                }

                block2.remove(&key);
            }
        }

        Ok(())
    }
}
