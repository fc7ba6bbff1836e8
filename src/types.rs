use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};

use crate::error::ConsumerError;

/// librdkafka's sentinel for "offset unknown / not yet resolved"
/// (`RD_KAFKA_OFFSET_INVALID`). Newly assigned partitions report this
/// until the committed position has been fetched from the broker.
pub const UNSET_OFFSET: i64 = -1001;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

/// A partition descriptor with a raw offset, as carried by broker event
/// payloads. The embedded error code is what librdkafka reports per
/// partition inside assignment/revocation/commit events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
    error: Option<RDKafkaErrorCode>,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self {
            partition,
            offset,
            error: None,
        }
    }

    pub fn with_error(mut self, code: RDKafkaErrorCode) -> Self {
        self.error = Some(code);
        self
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn error(&self) -> Option<RDKafkaErrorCode> {
        self.error
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionOffset {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self {
            partition: Partition::new(elem.topic().to_string(), elem.partition()),
            offset: elem.offset().to_raw().unwrap_or(UNSET_OFFSET),
            error: elem.error().err().and_then(|e| e.rdkafka_error_code()),
        }
    }
}

/// Convert a topic partition list into owned descriptors.
pub fn partition_offsets(tpl: &TopicPartitionList) -> Vec<PartitionOffset> {
    tpl.elements().into_iter().map(PartitionOffset::from).collect()
}

/// Build a topic partition list from owned descriptors, preserving raw
/// offsets (including `UNSET_OFFSET`, which maps back to `Offset::Invalid`).
pub fn topic_partition_list(
    offsets: &[PartitionOffset],
) -> Result<TopicPartitionList, rdkafka::error::KafkaError> {
    let mut tpl = TopicPartitionList::with_capacity(offsets.len());
    for po in offsets {
        tpl.add_partition_offset(po.topic(), po.partition_number(), Offset::from_raw(po.offset()))?;
    }
    Ok(tpl)
}

/// Return the first error embedded in a partition list, if any. The broker
/// client reports per-partition failures inside event payloads rather than
/// as top-level errors, so every list coming off the event stream gets
/// checked before it is acted on.
pub fn check_partitions(partitions: &[PartitionOffset]) -> Result<(), ConsumerError> {
    match partitions
        .iter()
        .find_map(|po| po.error().map(|code| (po, code)))
    {
        Some((po, code)) => Err(ConsumerError::Partition {
            topic: po.topic().to_string(),
            partition: po.partition_number(),
            code,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(topic: &str, partition: i32, offset: i64) -> PartitionOffset {
        PartitionOffset::new(Partition::new(topic.to_string(), partition), offset)
    }

    #[test]
    fn test_check_partitions_clean_list() {
        let partitions = vec![offset("events", 0, 10), offset("events", 1, 20)];
        assert!(check_partitions(&partitions).is_ok());
    }

    #[test]
    fn test_check_partitions_empty_list() {
        assert!(check_partitions(&[]).is_ok());
    }

    #[test]
    fn test_check_partitions_returns_first_error() {
        let partitions = vec![
            offset("events", 0, 10),
            offset("events", 1, 20).with_error(RDKafkaErrorCode::UnknownTopicOrPartition),
            offset("events", 2, 30).with_error(RDKafkaErrorCode::OffsetOutOfRange),
        ];

        let err = check_partitions(&partitions).unwrap_err();
        match err {
            ConsumerError::Partition {
                topic,
                partition,
                code,
            } => {
                assert_eq!(topic, "events");
                assert_eq!(partition, 1);
                assert_eq!(code, RDKafkaErrorCode::UnknownTopicOrPartition);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_topic_partition_list_round_trip() {
        let offsets = vec![offset("events", 0, 42), offset("events", 3, UNSET_OFFSET)];

        let tpl = topic_partition_list(&offsets).unwrap();
        let back = partition_offsets(&tpl);

        assert_eq!(back.len(), 2);
        assert_eq!(back[0].topic(), "events");
        assert_eq!(back[0].partition_number(), 0);
        assert_eq!(back[0].offset(), 42);
        assert_eq!(back[1].offset(), UNSET_OFFSET);
    }
}
