// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Modbus-TCP view of the register bank

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::registers::RegisterBank;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

pub const ILLEGAL_FUNCTION: u8 = 0x01;
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const GATEWAY_TARGET_FAILED: u8 = 0x0B;

const MAX_READ_QUANTITY: usize = 125;
const MAX_WRITE_QUANTITY: usize = 123;
const MBAP_HEADER_LEN: usize = 7;

fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

fn word(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Answer one request PDU (function code + data)
pub fn handle_pdu(bank: &RegisterBank, pdu: &[u8]) -> Vec<u8> {
    let Some((&function, data)) = pdu.split_first() else {
        return exception(0, ILLEGAL_FUNCTION);
    };

    match function {
        READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS => {
            if data.len() != 4 {
                return exception(function, ILLEGAL_DATA_VALUE);
            }
            let start = word(&data[0..2]) as usize;
            let quantity = word(&data[2..4]) as usize;
            if quantity == 0 || quantity > MAX_READ_QUANTITY {
                return exception(function, ILLEGAL_DATA_VALUE);
            }
            match bank.read(start, quantity) {
                Some(values) => {
                    let mut response = Vec::with_capacity(2 + quantity * 2);
                    response.push(function);
                    response.push((quantity * 2) as u8);
                    for value in values {
                        response.extend_from_slice(&value.to_be_bytes());
                    }
                    response
                }
                None => exception(function, ILLEGAL_DATA_ADDRESS),
            }
        }
        WRITE_SINGLE_REGISTER => {
            if data.len() != 4 {
                return exception(function, ILLEGAL_DATA_VALUE);
            }
            if bank.write(word(&data[0..2]) as usize, &[word(&data[2..4])]) {
                pdu.to_vec()
            } else {
                exception(function, ILLEGAL_DATA_ADDRESS)
            }
        }
        WRITE_MULTIPLE_REGISTERS => {
            if data.len() < 5 {
                return exception(function, ILLEGAL_DATA_VALUE);
            }
            let start = word(&data[0..2]) as usize;
            let quantity = word(&data[2..4]) as usize;
            let byte_count = data[4] as usize;
            if quantity == 0 || quantity > MAX_WRITE_QUANTITY || byte_count != quantity * 2 || data.len() != 5 + byte_count {
                return exception(function, ILLEGAL_DATA_VALUE);
            }
            let values: Vec<u16> = data[5..].chunks_exact(2).map(word).collect();
            if bank.write(start, &values) {
                let mut response = vec![function];
                response.extend_from_slice(&data[0..4]);
                response
            } else {
                exception(function, ILLEGAL_DATA_ADDRESS)
            }
        }
        other => exception(other, ILLEGAL_FUNCTION),
    }
}

/// Answer a complete ADU (MBAP header + PDU). `None` for malformed frames.
pub fn handle_frame(bank: &RegisterBank, unit_id: u8, frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return None;
    }
    let transaction = &frame[0..2];
    let protocol = word(&frame[2..4]);
    let unit = frame[6];
    let pdu = &frame[MBAP_HEADER_LEN..];
    if protocol != 0 || word(&frame[4..6]) as usize != pdu.len() + 1 {
        return None;
    }

    let response = if unit == unit_id || unit == 0 || unit == 0xFF {
        handle_pdu(bank, pdu)
    } else {
        exception(pdu[0], GATEWAY_TARGET_FAILED)
    };

    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + response.len());
    adu.extend_from_slice(transaction);
    adu.extend_from_slice(&0u16.to_be_bytes());
    adu.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
    adu.push(unit);
    adu.extend_from_slice(&response);
    Some(adu)
}

async fn serve_client(mut stream: TcpStream, addr: SocketAddr, bank: Arc<RegisterBank>, unit_id: u8) {
    let mut header = [0u8; MBAP_HEADER_LEN];
    loop {
        if stream.read_exact(&mut header).await.is_err() {
            break;
        }
        let length = word(&header[4..6]) as usize;
        if !(2..=254).contains(&length) {
            warn!("Modbus client {} sent bad length {}", addr, length);
            break;
        }

        let mut frame = header.to_vec();
        frame.resize(MBAP_HEADER_LEN + length - 1, 0);
        if stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await.is_err() {
            break;
        }

        let Some(response) = handle_frame(&bank, unit_id, &frame) else {
            warn!("Modbus client {} sent a malformed frame", addr);
            break;
        };
        if let Err(e) = stream.write_all(&response).await {
            debug!("Modbus client {} write failed: {}", addr, e);
            break;
        }
    }
    debug!("Modbus client {} disconnected", addr);
}

/// Modbus-TCP listener on its own single-threaded runtime
pub struct ModbusServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ModbusServer {
    pub fn start(bank: Arc<RegisterBank>, listen: &str, unit_id: u8) -> Result<Self> {
        let std_listener =
            std::net::TcpListener::bind(listen).with_context(|| format!("binding Modbus listener on {}", listen))?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("fleetsim-modbus".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(std_listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("Modbus listener setup failed: {}", e);
                            return;
                        }
                    };
                    info!("Modbus-TCP server listening on {}", local_addr);

                    loop {
                        tokio::select! {
                            accepted = listener.accept() => match accepted {
                                Ok((stream, addr)) => {
                                    debug!("Modbus client connected from {}", addr);
                                    tokio::spawn(serve_client(stream, addr, bank.clone(), unit_id));
                                }
                                Err(e) => warn!("Modbus accept error: {}", e),
                            },
                            _ = &mut shutdown_rx => break,
                        }
                    }
                    info!("Modbus-TCP server on {} stopped", local_addr);
                });
            })?;

        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ModbusServer {
    fn drop(&mut self) {
        self.stop();
    }
}
