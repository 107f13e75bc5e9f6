//! WebSocket control endpoint. Short-lived connections issue one-shot
//! control tasks; the play session stays open and receives progress
//! messages until playback ends or it disconnects.

use crate::protocol::{
    DevicesData, FlipData, LoadAudioData, PauseData, PlayData, ReplyEnvelope, RequestEnvelope,
    SeekData, VolumeData,
};
use daqplay_engine::client::Client;
use daqplay_engine::error::EngineError;
use daqplay_engine::message::{Action, Event, LoadRequest, Reply, SeekTarget};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

pub struct Server {
    listener: TcpListener,
    client: Client,
    shutdown: Arc<Notify>,
}

impl Server {
    pub async fn bind(client: Client, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!(addr = %listener.local_addr()?, "control socket listening");
        Ok(Self {
            listener,
            client,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until a `terminate` task arrives.
    pub async fn serve(self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "control connection accepted");
                        let client = self.client.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, client, shutdown).await {
                                debug!("control connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                    }
                },
                _ = self.shutdown.notified() => {
                    info!("terminate received, control socket closing");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    client: Client,
    shutdown: Arc<Notify>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    // Per-connection send queue; one writer keeps reply and progress
    // messages ordered no matter which task produced them.
    let (out_tx, mut out_rx) = unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // True while this connection owns an unfinished play session.
    let play_active = Arc::new(AtomicBool::new(false));

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("socket read error: {}", e);
                break;
            }
        };
        match message {
            WsMessage::Text(text) => {
                let request: RequestEnvelope = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        // Malformed JSON closes the connection.
                        warn!("malformed control message: {}", e);
                        let reply = ReplyEnvelope::error(
                            None,
                            "unknown",
                            "protocol",
                            format!("malformed message: {}", e),
                        );
                        let _ = out_tx.send(reply.to_json());
                        break;
                    }
                };
                let done = dispatch(&client, &shutdown, &out_tx, &play_active, request).await;
                if done {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            _ => {}
        }
    }

    // Loss of the requesting connection cancels its play.
    if play_active.load(Ordering::SeqCst) {
        debug!("play connection lost, pausing");
        let _ = client.request(Action::Pause { stop: false }).await;
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Handle one task. Returns true when the connection should close.
async fn dispatch(
    client: &Client,
    shutdown: &Arc<Notify>,
    out: &UnboundedSender<String>,
    play_active: &Arc<AtomicBool>,
    request: RequestEnvelope,
) -> bool {
    let id = request.id.clone();
    let task = request.task.clone();
    let data = request.data.unwrap_or(Value::Null);

    macro_rules! parse {
        ($ty:ty) => {
            match serde_json::from_value::<$ty>(data.clone()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let reply = ReplyEnvelope::error(
                        id,
                        &task,
                        "validation",
                        format!("bad '{}' data: {}", task, e),
                    );
                    let _ = out.send(reply.to_json());
                    return false;
                }
            }
        };
    }
    macro_rules! parse_opt {
        ($ty:ty) => {
            if data.is_null() {
                <$ty>::default()
            } else {
                parse!($ty)
            }
        };
    }

    match task.as_str() {
        "healthcheck" => {
            let data = json!({ "ok": true, "pid": std::process::id() });
            send_success(out, id, &task, Some(data), true);
        }
        "pid" => {
            send_success(out, id, &task, Some(json!({ "pid": std::process::id() })), true);
        }
        "status" => {
            let result = client.request(Action::Status).await;
            send_reply(out, id, &task, result);
        }
        "terminate" => {
            let result = client.request(Action::Terminate).await;
            send_reply(out, id, &task, result);
            // notify_one stores a permit, so the accept loop shuts down
            // even if it is mid-poll.
            shutdown.notify_one();
            return true;
        }
        "load_audio" => {
            let load = parse!(LoadAudioData);
            let action = Action::LoadAudio(Box::new(LoadRequest {
                file_path: PathBuf::from(load.file_path),
                device_name: load.device_name,
                ao_channels: load.ao_channels,
                do_channels: load.do_channels,
                ai_channels: load.ai_channels,
                volume: load.volume,
                samples_per_frame: load.samples_per_frame,
                flip_lr_stereo: load.flip_lr_stereo,
            }));
            let result = client.request(action).await;
            send_reply(out, id, &task, result);
        }
        "play" => {
            let play = parse_opt!(PlayData);
            // Subscribe before starting so no progress message is missed.
            let events = client.subscribe();
            let result = client
                .request(Action::Play {
                    start_position_s: play.start_position,
                    volume: play.volume,
                    loop_mode: play.loop_mode,
                })
                .await;
            match result {
                Ok(reply) => {
                    send_success(out, id.clone(), &task, reply_data(reply), false);
                    play_active.store(true, Ordering::SeqCst);
                    spawn_play_forwarder(events, out.clone(), id, play_active.clone());
                }
                Err(e) => {
                    send_engine_error(out, id, &task, e);
                }
            }
        }
        "pause" => {
            let pause = parse_opt!(PauseData);
            let result = client
                .request(Action::Pause {
                    stop: pause.stop.unwrap_or(false),
                })
                .await;
            send_reply(out, id, &task, result);
        }
        "resume" => {
            let result = client.request(Action::Resume).await;
            send_reply(out, id, &task, result);
        }
        "volume" => {
            let volume = parse!(VolumeData);
            let result = client.request(Action::SetVolume(volume.volume)).await;
            send_reply(out, id, &task, result);
        }
        "seek" => {
            let seek = parse_opt!(SeekData);
            let target = match (seek.time, seek.position) {
                (Some(time), _) => SeekTarget::Seconds(time),
                (None, Some(position)) => SeekTarget::Samples(position),
                (None, None) => {
                    let reply = ReplyEnvelope::error(
                        id,
                        &task,
                        "validation",
                        "seek requires 'time' or 'position'".to_string(),
                    );
                    let _ = out.send(reply.to_json());
                    return false;
                }
            };
            let result = client.request(Action::Seek(target)).await;
            send_reply(out, id, &task, result);
        }
        "get_position" => {
            let result = client.request(Action::GetPosition).await;
            send_reply(out, id, &task, result);
        }
        "flip_lr_stereo" => {
            let flip = parse_opt!(FlipData);
            let result = client.request(Action::FlipStereo(flip.flip_lr_stereo)).await;
            send_reply(out, id, &task, result);
        }
        "devices" => {
            let devices = parse_opt!(DevicesData);
            let result = client
                .request(Action::ListDevices {
                    refresh: devices.refresh,
                })
                .await;
            send_reply(out, id, &task, result);
        }
        _ => {
            let reply = ReplyEnvelope::error(
                id,
                &task,
                "unknown_task",
                format!("no handler for task '{}'", task),
            );
            let _ = out.send(reply.to_json());
        }
    }
    false
}

/// Forward playback events to the play session until the run terminates.
fn spawn_play_forwarder(
    mut events: tokio::sync::mpsc::UnboundedReceiver<Event>,
    out: UnboundedSender<String>,
    id: Option<Value>,
    play_active: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Progress(update) => {
                    let data = match serde_json::to_value(&update) {
                        Ok(mut value) => {
                            value["event"] = json!("progress_update");
                            value
                        }
                        Err(_) => continue,
                    };
                    let reply =
                        ReplyEnvelope::success(id.clone(), "play", Some(data), false);
                    if out.send(reply.to_json()).is_err() {
                        break;
                    }
                }
                Event::Completed(info) => {
                    let data = json!({
                        "event": "playback_completed",
                        "audio_completed": true,
                        "status": serde_json::to_value(&info).unwrap_or(Value::Null),
                    });
                    let reply = ReplyEnvelope::success(id.clone(), "play", Some(data), true);
                    let _ = out.send(reply.to_json());
                    break;
                }
                Event::Stopped { info, error } => {
                    let data = json!({
                        "event": "playback_stopped",
                        "audio_completed": false,
                        "status": info
                            .map(|i| serde_json::to_value(&i).unwrap_or(Value::Null))
                            .unwrap_or(Value::Null),
                        "error": error,
                    });
                    let mut reply = ReplyEnvelope::success(id.clone(), "play", Some(data), true);
                    if reply
                        .data
                        .as_ref()
                        .and_then(|d| d.get("error"))
                        .map(|e| !e.is_null())
                        .unwrap_or(false)
                    {
                        reply.status = "error";
                    }
                    let _ = out.send(reply.to_json());
                    break;
                }
            }
        }
        play_active.store(false, Ordering::SeqCst);
    });
}

fn reply_data(reply: Reply) -> Option<Value> {
    match reply {
        Reply::Ack => None,
        Reply::Status(Some(info)) => serde_json::to_value(&info).ok(),
        Reply::Status(None) => Some(json!({ "state": "idle" })),
        Reply::Devices {
            devices,
            driver_version,
        } => Some(json!({
            "devices": devices,
            "driver_version": driver_version,
        })),
        Reply::Position {
            position_s,
            duration_s,
            position_samples,
            total_samples,
        } => Some(json!({
            "position_s": position_s,
            "duration_s": duration_s,
            "position_samples": position_samples,
            "total_samples": total_samples,
        })),
        Reply::Volume { volume } => Some(json!({ "volume": volume })),
        Reply::Flip { flip_lr_stereo } => Some(json!({ "flip_lr_stereo": flip_lr_stereo })),
    }
}

fn send_success(
    out: &UnboundedSender<String>,
    id: Option<Value>,
    task: &str,
    data: Option<Value>,
    completed: bool,
) {
    let reply = ReplyEnvelope::success(id, task, data, completed);
    let _ = out.send(reply.to_json());
}

fn send_engine_error(out: &UnboundedSender<String>, id: Option<Value>, task: &str, e: EngineError) {
    let reply = ReplyEnvelope::error(id, task, e.kind(), e.to_string());
    let _ = out.send(reply.to_json());
}

fn send_reply(
    out: &UnboundedSender<String>,
    id: Option<Value>,
    task: &str,
    result: Result<Reply, EngineError>,
) {
    match result {
        Ok(reply) => send_success(out, id, task, reply_data(reply), true),
        Err(e) => send_engine_error(out, id, task, e),
    }
}
