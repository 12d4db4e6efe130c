use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    message::Delivery as LapinDelivery,
    options::*,
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Acker, BrokerChannel, BrokerConnection, Confirmation, ConnectionFactory, Delivery,
    DeliveryStream, PendingConfirm, Qos,
};
use crate::error::{PoolError, Result};
use crate::message::{DeliveryInfo, Headers, Properties, WireMessage};
use crate::transformer::{
    ConnectionArgs, ConsumeArgs, ExchangeDeclareArgs, PublishArgs, QueueDeclareArgs,
};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, retrying like a supervised client should
#[derive(Debug, Clone)]
pub struct LapinConnectionFactory {
    connection_name: String,
}

impl LapinConnectionFactory {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

impl Default for LapinConnectionFactory {
    fn default() -> Self {
        Self::new("rabbitpool")
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(&self, args: &ConnectionArgs) -> Result<Box<dyn BrokerConnection>> {
        let uri = amqp_uri(args);
        let mut attempts = 0;

        loop {
            debug!("Attempting to connect to {}", args.redacted_uri());
            let properties = ConnectionProperties::default().with_connection_name(
                format!("{}-{}", self.connection_name, Uuid::new_v4()).into(),
            );

            match Connection::connect_uri(uri.clone(), properties).await {
                Ok(connection) => {
                    info!("Connected to RabbitMQ at {}", args.redacted_uri());
                    return Ok(Box::new(LapinConnection { connection }));
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= args.connect_retries {
                        error!(
                            "Failed to connect to RabbitMQ after {} attempts: {}",
                            attempts, e
                        );
                        return Err(e.into());
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {:?}: {}",
                        attempts, args.retry_delay, e
                    );
                    tokio::time::sleep(args.retry_delay).await;
                }
            }
        }
    }
}

/// Connection target handed to lapin as a structure, so IP literal hosts
/// reach the socket layer unchanged.
fn amqp_uri(args: &ConnectionArgs) -> AMQPUri {
    AMQPUri {
        scheme: if args.ssl {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: args.user.clone(),
                password: args.password.clone(),
            },
            host: args.host.clone(),
            port: args.port,
        },
        vhost: args.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(args.heartbeat),
            connection_timeout: Some(
                u64::try_from(args.connection_timeout.as_millis()).unwrap_or(u64::MAX),
            ),
            ..AMQPQueryString::default()
        },
    }
}

/// lapin-backed connection
pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!("Opened channel {}", channel.id());
        Ok(Box::new(LapinChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// lapin emits heartbeat frames from its own I/O loop, so this only
    /// verifies that the connection is still alive.
    async fn heartbeat(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PoolError::ConnectionClosed {
                reason: "connection is no longer connected".to_string(),
            })
        }
    }

    async fn close(&self) -> Result<()> {
        if self.is_connected() {
            self.connection.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

/// lapin-backed protocol channel
pub struct LapinChannel {
    channel: Channel,
}

/// A broker-side channel close (for example NOT_FOUND on a passive declare)
fn declare_error(error: lapin::Error) -> PoolError {
    match error {
        lapin::Error::ProtocolError(amqp_error) => PoolError::ChannelException {
            reason: amqp_error.to_string(),
        },
        other => PoolError::Connection(other),
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "topic" => ExchangeKind::Topic,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, args: &ExchangeDeclareArgs) -> Result<()> {
        self.channel
            .exchange_declare(
                &args.exchange,
                exchange_kind(&args.kind),
                ExchangeDeclareOptions {
                    passive: args.passive,
                    durable: args.durable,
                    auto_delete: args.auto_delete,
                    internal: args.internal,
                    nowait: args.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;
        Ok(())
    }

    async fn queue_declare(&self, args: &QueueDeclareArgs) -> Result<()> {
        self.channel
            .queue_declare(
                &args.queue,
                QueueDeclareOptions {
                    passive: args.passive,
                    durable: args.durable,
                    exclusive: args.exclusive,
                    auto_delete: args.auto_delete,
                    nowait: args.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn exchange_bind(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32> {
        Ok(self
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?)
    }

    async fn basic_qos(&self, qos: &Qos) -> Result<()> {
        if qos.prefetch_size != 0 {
            debug!(
                "Ignoring prefetch_size {}: not supported by the client",
                qos.prefetch_size
            );
        }
        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(&self, args: &PublishArgs, message: WireMessage) -> Result<PendingConfirm> {
        let properties = to_basic_properties(&message.properties, &message.headers);
        let confirm = self
            .channel
            .basic_publish(
                &args.exchange,
                &args.routing_key,
                BasicPublishOptions {
                    mandatory: args.mandatory,
                    immediate: args.immediate,
                },
                &message.body,
                properties,
            )
            .await?;

        Ok(Box::pin(async move {
            let confirmation = match confirm.await? {
                LapinConfirmation::Ack(Some(_returned)) => Confirmation::Returned,
                LapinConfirmation::Ack(None) => Confirmation::Ack,
                LapinConfirmation::Nack(_) => Confirmation::Nack,
                LapinConfirmation::NotRequested => Confirmation::NotRequested,
            };
            Ok(confirmation)
        }))
    }

    async fn basic_consume(&self, args: &ConsumeArgs) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                &args.queue,
                &args.consumer_tag,
                BasicConsumeOptions {
                    no_local: args.no_local,
                    no_ack: args.no_ack,
                    exclusive: args.exclusive,
                    nowait: args.nowait,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(PoolError::from))
            .boxed())
    }

    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;
        Ok(message.map(|message| into_delivery(message.delivery)))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: LapinDelivery) -> Delivery {
    let info = DeliveryInfo {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
    };
    let (properties, headers) = from_basic_properties(&delivery.properties);
    let message = WireMessage {
        properties,
        headers,
        body: delivery.data,
    };
    Delivery::new(info, message, Box::new(AmqpAcker(delivery.acker)))
}

fn to_basic_properties(properties: &Properties, headers: &Headers) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(value) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(value.clone()));
    }
    if let Some(value) = properties.timestamp {
        basic = basic.with_timestamp(value);
    }
    if let Some(value) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(value.clone()));
    }
    if let Some(value) = properties.delivery_mode {
        basic = basic.with_delivery_mode(value);
    }
    if let Some(value) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.user_id {
        basic = basic.with_user_id(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.kind {
        basic = basic.with_type(ShortString::from(value.clone()));
    }
    if let Some(value) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(value.clone()));
    }
    if let Some(value) = properties.priority {
        basic = basic.with_priority(value);
    }
    if let Some(value) = &properties.cluster_id {
        basic = basic.with_cluster_id(ShortString::from(value.clone()));
    }

    basic.with_headers(to_field_table(headers))
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|value| value.as_str().to_string())
}

fn from_basic_properties(basic: &BasicProperties) -> (Properties, Headers) {
    let properties = Properties {
        content_type: short(basic.content_type()),
        content_encoding: short(basic.content_encoding()),
        message_id: short(basic.message_id()),
        correlation_id: short(basic.correlation_id()),
        timestamp: *basic.timestamp(),
        expiration: short(basic.expiration()),
        delivery_mode: *basic.delivery_mode(),
        app_id: short(basic.app_id()),
        user_id: short(basic.user_id()),
        kind: short(basic.kind()),
        reply_to: short(basic.reply_to()),
        priority: *basic.priority(),
        cluster_id: short(basic.cluster_id()),
    };
    let headers = basic
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();
    (properties, headers)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;

    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => AMQPValue::LongLongInt(integer),
            None => AMQPValue::Double(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), to_amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> serde_json::Value {
    use serde_json::Value;

    let float = |value: f64| {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    };

    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(number) => Value::from(*number),
        AMQPValue::ShortShortUInt(number) => Value::from(*number),
        AMQPValue::ShortInt(number) => Value::from(*number),
        AMQPValue::ShortUInt(number) => Value::from(*number),
        AMQPValue::LongInt(number) => Value::from(*number),
        AMQPValue::LongUInt(number) => Value::from(*number),
        AMQPValue::LongLongInt(number) => Value::from(*number),
        AMQPValue::Timestamp(number) => Value::from(*number),
        AMQPValue::Float(number) => float(f64::from(*number)),
        AMQPValue::Double(number) => float(*number),
        AMQPValue::ShortString(text) => Value::String(text.as_str().to_string()),
        AMQPValue::LongString(text) => {
            Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            from_field_table(table).into_iter().collect::<serde_json::Map<_, _>>(),
        ),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_table_conversion() {
        let mut headers = Headers::new();
        headers.insert("version".to_string(), json!("1.0.0"));
        headers.insert("statusCode".to_string(), json!(200));
        headers.insert("ratio".to_string(), json!(0.5));
        headers.insert("tags".to_string(), json!(["a", "b"]));
        headers.insert("nested".to_string(), json!({"retry": true}));

        let table = to_field_table(&headers);
        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn test_properties_conversion() {
        let properties = Properties {
            content_type: Some("application/json".to_string()),
            correlation_id: Some("abc".to_string()),
            reply_to: Some("rpc.replies".to_string()),
            kind: Some("doSomething".to_string()),
            delivery_mode: Some(2),
            priority: Some(4),
            timestamp: Some(1_700_000_000),
            ..Properties::default()
        };

        let basic = to_basic_properties(&properties, &Headers::new());
        let (converted, headers) = from_basic_properties(&basic);
        assert_eq!(converted, properties);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_connection_target_keeps_raw_host_and_vhost() {
        let settings = crate::config::AmqpSettings {
            host: "::1".to_string(),
            heartbeat: 30,
            ..crate::config::AmqpSettings::default()
        };
        let args = crate::transformer::AmqpTransformer::to_connection_args(&settings);

        let uri = amqp_uri(&args);
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "::1");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(30));
        assert_eq!(uri.query.connection_timeout, Some(3_000));
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom(kind) if kind == "x-delayed-message"
        ));
    }
}
