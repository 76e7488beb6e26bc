//! Application Service Data Unit
//!
//! The engine treats information objects as opaque bytes. Only the header and
//! the single-object system commands it routes to typed handlers are decoded
//! here (interrogation qualifiers, read address, clock sync time, reset
//! qualifier, delay value).

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::config::AppLayerParameters;
use crate::error::{IecError, IecResult};

/// Largest ASDU carried by one I-frame (253 - 4 control octets)
pub const MAX_ASDU_LENGTH: usize = 249;

const COT_NEGATIVE: u8 = 0x40;
const COT_TEST: u8 = 0x80;
const COT_CAUSE_MASK: u8 = 0x3F;
const VSQ_SEQUENCE: u8 = 0x80;
const VSQ_COUNT_MASK: u8 = 0x7F;

/// Type identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    SinglePoint = 1,
    SinglePointTime24 = 2,
    DoublePoint = 3,
    DoublePointTime24 = 4,
    StepPosition = 5,
    StepPositionTime24 = 6,
    Bitstring32 = 7,
    Bitstring32Time24 = 8,
    MeasuredNormalized = 9,
    MeasuredNormalizedTime24 = 10,
    MeasuredScaled = 11,
    MeasuredScaledTime24 = 12,
    MeasuredFloat = 13,
    MeasuredFloatTime24 = 14,
    IntegratedTotals = 15,
    IntegratedTotalsTime24 = 16,
    ProtectionEventTime24 = 17,
    ProtectionStartEventsTime24 = 18,
    ProtectionOutputCircuitTime24 = 19,
    PackedSinglePointWithScd = 20,
    MeasuredNormalizedNoQuality = 21,
    SinglePointTime56 = 30,
    DoublePointTime56 = 31,
    StepPositionTime56 = 32,
    Bitstring32Time56 = 33,
    MeasuredNormalizedTime56 = 34,
    MeasuredScaledTime56 = 35,
    MeasuredFloatTime56 = 36,
    IntegratedTotalsTime56 = 37,
    ProtectionEventTime56 = 38,
    ProtectionStartEventsTime56 = 39,
    ProtectionOutputCircuitTime56 = 40,
    SingleCommand = 45,
    DoubleCommand = 46,
    RegulatingStepCommand = 47,
    SetpointNormalized = 48,
    SetpointScaled = 49,
    SetpointFloat = 50,
    Bitstring32Command = 51,
    SingleCommandTime56 = 58,
    DoubleCommandTime56 = 59,
    RegulatingStepCommandTime56 = 60,
    SetpointNormalizedTime56 = 61,
    SetpointScaledTime56 = 62,
    SetpointFloatTime56 = 63,
    Bitstring32CommandTime56 = 64,
    EndOfInitialization = 70,
    InterrogationCommand = 100,
    CounterInterrogationCommand = 101,
    ReadCommand = 102,
    ClockSyncCommand = 103,
    TestCommand = 104,
    ResetProcessCommand = 105,
    DelayAcquisitionCommand = 106,
    TestCommandTime56 = 107,
    ParameterNormalized = 110,
    ParameterScaled = 111,
    ParameterFloat = 112,
    ParameterActivation = 113,
    FileReady = 120,
    SectionReady = 121,
    CallDirectory = 122,
    LastSection = 123,
    AckFile = 124,
    Segment = 125,
    Directory = 126,
    QueryLog = 127,
}

impl TypeId {
    pub fn from_byte(value: u8) -> Option<Self> {
        use TypeId::*;
        let id = match value {
            1 => SinglePoint,
            2 => SinglePointTime24,
            3 => DoublePoint,
            4 => DoublePointTime24,
            5 => StepPosition,
            6 => StepPositionTime24,
            7 => Bitstring32,
            8 => Bitstring32Time24,
            9 => MeasuredNormalized,
            10 => MeasuredNormalizedTime24,
            11 => MeasuredScaled,
            12 => MeasuredScaledTime24,
            13 => MeasuredFloat,
            14 => MeasuredFloatTime24,
            15 => IntegratedTotals,
            16 => IntegratedTotalsTime24,
            17 => ProtectionEventTime24,
            18 => ProtectionStartEventsTime24,
            19 => ProtectionOutputCircuitTime24,
            20 => PackedSinglePointWithScd,
            21 => MeasuredNormalizedNoQuality,
            30 => SinglePointTime56,
            31 => DoublePointTime56,
            32 => StepPositionTime56,
            33 => Bitstring32Time56,
            34 => MeasuredNormalizedTime56,
            35 => MeasuredScaledTime56,
            36 => MeasuredFloatTime56,
            37 => IntegratedTotalsTime56,
            38 => ProtectionEventTime56,
            39 => ProtectionStartEventsTime56,
            40 => ProtectionOutputCircuitTime56,
            45 => SingleCommand,
            46 => DoubleCommand,
            47 => RegulatingStepCommand,
            48 => SetpointNormalized,
            49 => SetpointScaled,
            50 => SetpointFloat,
            51 => Bitstring32Command,
            58 => SingleCommandTime56,
            59 => DoubleCommandTime56,
            60 => RegulatingStepCommandTime56,
            61 => SetpointNormalizedTime56,
            62 => SetpointScaledTime56,
            63 => SetpointFloatTime56,
            64 => Bitstring32CommandTime56,
            70 => EndOfInitialization,
            100 => InterrogationCommand,
            101 => CounterInterrogationCommand,
            102 => ReadCommand,
            103 => ClockSyncCommand,
            104 => TestCommand,
            105 => ResetProcessCommand,
            106 => DelayAcquisitionCommand,
            107 => TestCommandTime56,
            110 => ParameterNormalized,
            111 => ParameterScaled,
            112 => ParameterFloat,
            113 => ParameterActivation,
            120 => FileReady,
            121 => SectionReady,
            122 => CallDirectory,
            123 => LastSection,
            124 => AckFile,
            125 => Segment,
            126 => Directory,
            127 => QueryLog,
            _ => return None,
        };
        Some(id)
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.to_byte())
    }
}

/// Cause of transmission (the 6 bit cause field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CauseOfTransmission {
    Periodic,
    Background,
    Spontaneous,
    Initialized,
    Request,
    Activation,
    ActivationConfirmation,
    Deactivation,
    DeactivationConfirmation,
    ActivationTermination,
    ReturnRemoteCommand,
    ReturnLocalCommand,
    FileTransfer,
    /// Answer to a station interrogation
    InterrogatedByStation,
    /// Answer to a group interrogation, group 1..=16
    InterrogatedByGroup(u8),
    /// Answer to a general counter request
    RequestedByGeneralCounter,
    /// Answer to a counter group request, group 1..=4
    RequestedByCounterGroup(u8),
    UnknownTypeIdentification,
    UnknownCauseOfTransmission,
    UnknownCommonAddress,
    UnknownInformationObjectAddress,
}

impl CauseOfTransmission {
    pub fn from_byte(value: u8) -> Option<Self> {
        use CauseOfTransmission::*;
        let cause = match value & COT_CAUSE_MASK {
            1 => Periodic,
            2 => Background,
            3 => Spontaneous,
            4 => Initialized,
            5 => Request,
            6 => Activation,
            7 => ActivationConfirmation,
            8 => Deactivation,
            9 => DeactivationConfirmation,
            10 => ActivationTermination,
            11 => ReturnRemoteCommand,
            12 => ReturnLocalCommand,
            13 => FileTransfer,
            20 => InterrogatedByStation,
            n @ 21..=36 => InterrogatedByGroup(n - 20),
            37 => RequestedByGeneralCounter,
            n @ 38..=41 => RequestedByCounterGroup(n - 37),
            44 => UnknownTypeIdentification,
            45 => UnknownCauseOfTransmission,
            46 => UnknownCommonAddress,
            47 => UnknownInformationObjectAddress,
            _ => return None,
        };
        Some(cause)
    }

    pub fn to_byte(self) -> u8 {
        use CauseOfTransmission::*;
        match self {
            Periodic => 1,
            Background => 2,
            Spontaneous => 3,
            Initialized => 4,
            Request => 5,
            Activation => 6,
            ActivationConfirmation => 7,
            Deactivation => 8,
            DeactivationConfirmation => 9,
            ActivationTermination => 10,
            ReturnRemoteCommand => 11,
            ReturnLocalCommand => 12,
            FileTransfer => 13,
            InterrogatedByStation => 20,
            InterrogatedByGroup(group) => 20 + group.clamp(1, 16),
            RequestedByGeneralCounter => 37,
            RequestedByCounterGroup(group) => 37 + group.clamp(1, 4),
            UnknownTypeIdentification => 44,
            UnknownCauseOfTransmission => 45,
            UnknownCommonAddress => 46,
            UnknownInformationObjectAddress => 47,
        }
    }
}

/// Seven octet binary time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cp56Time2a {
    /// Milliseconds within the minute, 0..=59999
    pub millisecond: u16,
    pub minute: u8,
    pub hour: u8,
    pub day_of_month: u8,
    /// 1 = Monday .. 7 = Sunday, 0 = not used
    pub day_of_week: u8,
    pub month: u8,
    /// Years since 2000, 0..=99
    pub year: u8,
    pub invalid: bool,
    pub summer_time: bool,
}

impl Cp56Time2a {
    pub const LENGTH: usize = 7;

    pub fn decode(data: &[u8]) -> IecResult<Self> {
        if data.len() < Self::LENGTH {
            return Err(IecError::MalformedAsdu(format!(
                "CP56Time2a needs {} octets, got {}",
                Self::LENGTH,
                data.len()
            )));
        }
        Ok(Self {
            millisecond: u16::from_le_bytes([data[0], data[1]]),
            minute: data[2] & 0x3F,
            invalid: data[2] & 0x80 != 0,
            hour: data[3] & 0x1F,
            summer_time: data[3] & 0x80 != 0,
            day_of_month: data[4] & 0x1F,
            day_of_week: data[4] >> 5,
            month: data[5] & 0x0F,
            year: data[6] & 0x7F,
        })
    }

    pub fn encode(&self) -> [u8; 7] {
        let ms = self.millisecond.to_le_bytes();
        [
            ms[0],
            ms[1],
            (self.minute & 0x3F) | if self.invalid { 0x80 } else { 0 },
            (self.hour & 0x1F) | if self.summer_time { 0x80 } else { 0 },
            (self.day_of_month & 0x1F) | ((self.day_of_week & 0x07) << 5),
            self.month & 0x0F,
            self.year & 0x7F,
        ]
    }

    pub fn from_datetime(time: &NaiveDateTime) -> Self {
        let millis = time.second() * 1000 + (time.nanosecond() / 1_000_000).min(999);
        Self {
            millisecond: millis as u16,
            minute: time.minute() as u8,
            hour: time.hour() as u8,
            day_of_month: time.day() as u8,
            day_of_week: time.weekday().number_from_monday() as u8,
            month: time.month() as u8,
            year: (time.year() - 2000).rem_euclid(100) as u8,
            invalid: false,
            summer_time: false,
        }
    }

    /// Calendar time, `None` when the fields do not form a valid date
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            2000 + i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day_of_month),
        )?
        .and_hms_milli_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.millisecond / 1000),
            u32::from(self.millisecond % 1000),
        )
    }
}

/// Two octet delay in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cp16Time2a(pub u16);

/// Qualifier of counter interrogation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterQualifier {
    /// Request (RQT): 5 = general, 1..=4 = counter group
    pub request: u8,
    /// Freeze (FRZ): 0 read, 1 freeze, 2 freeze and reset, 3 reset
    pub freeze: u8,
}

impl CounterQualifier {
    pub fn from_byte(value: u8) -> Self {
        Self {
            request: value & 0x3F,
            freeze: value >> 6,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.request & 0x3F) | (self.freeze << 6)
    }
}

/// An ASDU with opaque information objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asdu {
    type_id: u8,
    vsq: u8,
    cause: u8,
    negative: bool,
    test: bool,
    originator: u8,
    common_address: u16,
    objects: Bytes,
}

impl Asdu {
    pub fn new(type_id: TypeId, cause: CauseOfTransmission, common_address: u16) -> Self {
        Self {
            type_id: type_id.to_byte(),
            vsq: 0,
            cause: cause.to_byte(),
            negative: false,
            test: false,
            originator: 0,
            common_address,
            objects: Bytes::new(),
        }
    }

    /// Build from raw header fields and already encoded information objects
    pub fn from_parts(
        type_id: u8,
        vsq: u8,
        cause: u8,
        common_address: u16,
        objects: Bytes,
    ) -> Self {
        Self {
            type_id,
            vsq,
            cause: cause & COT_CAUSE_MASK,
            negative: cause & COT_NEGATIVE != 0,
            test: cause & COT_TEST != 0,
            originator: 0,
            common_address,
            objects,
        }
    }

    pub fn with_originator(mut self, originator: u8) -> Self {
        self.originator = originator;
        self
    }

    pub fn type_id(&self) -> Option<TypeId> {
        TypeId::from_byte(self.type_id)
    }

    pub fn raw_type_id(&self) -> u8 {
        self.type_id
    }

    pub fn cause(&self) -> Option<CauseOfTransmission> {
        CauseOfTransmission::from_byte(self.cause)
    }

    pub fn raw_cause(&self) -> u8 {
        self.cause
    }

    pub fn set_cause(&mut self, cause: CauseOfTransmission) {
        self.cause = cause.to_byte();
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn set_negative(&mut self, negative: bool) {
        self.negative = negative;
    }

    pub fn is_test(&self) -> bool {
        self.test
    }

    pub fn set_test(&mut self, test: bool) {
        self.test = test;
    }

    pub fn originator(&self) -> u8 {
        self.originator
    }

    pub fn common_address(&self) -> u16 {
        self.common_address
    }

    pub fn is_sequence(&self) -> bool {
        self.vsq & VSQ_SEQUENCE != 0
    }

    pub fn object_count(&self) -> u8 {
        self.vsq & VSQ_COUNT_MASK
    }

    /// Encoded information objects
    pub fn objects(&self) -> &Bytes {
        &self.objects
    }

    /// Append one information object (address + encoded element)
    pub fn push_object(
        &mut self,
        ioa: u32,
        element: &[u8],
        params: &AppLayerParameters,
    ) -> IecResult<()> {
        let ioa_len = usize::from(params.size_of_ioa);
        if ioa_len < 3 && ioa >= 1 << (8 * ioa_len) {
            return Err(IecError::MalformedAsdu(format!(
                "IOA {} does not fit in {} octet(s)",
                ioa, ioa_len
            )));
        }
        if self.object_count() == VSQ_COUNT_MASK {
            return Err(IecError::MalformedAsdu(
                "ASDU already holds 127 information objects".into(),
            ));
        }
        let new_len = self.encoded_len(params) + ioa_len + element.len();
        if new_len > MAX_ASDU_LENGTH {
            return Err(IecError::MalformedAsdu(format!(
                "ASDU would grow to {} octets (max {})",
                new_len, MAX_ASDU_LENGTH
            )));
        }

        let mut buf = BytesMut::with_capacity(self.objects.len() + ioa_len + element.len());
        buf.extend_from_slice(&self.objects);
        buf.put_uint_le(u64::from(ioa), ioa_len);
        buf.extend_from_slice(element);
        self.objects = buf.freeze();
        self.vsq = (self.vsq & VSQ_SEQUENCE) | (self.object_count() + 1);
        Ok(())
    }

    /// Address and element bytes of the first information object
    pub fn first_object(&self, params: &AppLayerParameters) -> Option<(u32, &[u8])> {
        let ioa_len = usize::from(params.size_of_ioa);
        if self.objects.len() < ioa_len {
            return None;
        }
        let mut ioa = &self.objects[..ioa_len];
        let address = ioa.get_uint_le(ioa_len) as u32;
        Some((address, &self.objects[ioa_len..]))
    }

    pub fn encoded_len(&self, params: &AppLayerParameters) -> usize {
        params.header_len() + self.objects.len()
    }

    pub fn encode(&self, params: &AppLayerParameters) -> IecResult<Bytes> {
        let len = self.encoded_len(params);
        if len > MAX_ASDU_LENGTH {
            return Err(IecError::MalformedAsdu(format!(
                "encoded ASDU is {} octets (max {})",
                len, MAX_ASDU_LENGTH
            )));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.type_id);
        buf.put_u8(self.vsq);
        let mut cot = self.cause & COT_CAUSE_MASK;
        if self.negative {
            cot |= COT_NEGATIVE;
        }
        if self.test {
            cot |= COT_TEST;
        }
        buf.put_u8(cot);
        if params.size_of_cot == 2 {
            buf.put_u8(self.originator);
        }
        if params.size_of_ca == 2 {
            buf.put_u16_le(self.common_address);
        } else {
            buf.put_u8(self.common_address as u8);
        }
        buf.extend_from_slice(&self.objects);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8], params: &AppLayerParameters) -> IecResult<Self> {
        let header_len = params.header_len();
        if data.len() < header_len {
            return Err(IecError::MalformedAsdu(format!(
                "ASDU of {} octets is shorter than its {} octet header",
                data.len(),
                header_len
            )));
        }

        let mut buf = data;
        let type_id = buf.get_u8();
        let vsq = buf.get_u8();
        let cot = buf.get_u8();
        let originator = if params.size_of_cot == 2 { buf.get_u8() } else { 0 };
        let common_address = if params.size_of_ca == 2 {
            buf.get_u16_le()
        } else {
            u16::from(buf.get_u8())
        };

        Ok(Self::from_parts(
            type_id,
            vsq,
            cot,
            common_address,
            Bytes::copy_from_slice(buf),
        )
        .with_originator(originator))
    }
}

impl fmt::Display for Asdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TI={} COT={}{}{} CA={} OA={} objects={}",
            self.type_id,
            self.cause,
            if self.negative { " (negative)" } else { "" },
            if self.test { " (test)" } else { "" },
            self.common_address,
            self.originator,
            self.object_count()
        )
    }
}
