//! Class-of-device classification.
//!
//! Maps a class-of-device triple to a semantic device type and an icon
//! name for the UI.

use serde::{Deserialize, Serialize};

/// Bit of the major service class field advertising the Audio service.
const SERVICE_CLASS_AUDIO: u16 = 0x100;

/// Icon used whenever a type has no dedicated icon.
pub const FALLBACK_ICON: &str = "bluetooth";

/// A decoded class-of-device triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassOfDevice {
   pub major_service_class: u16,
   pub major_device_class: u8,
   pub minor_device_class: u8,
}

/// Semantic device types.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceType {
   Computer,
   Pda,
   Phone,
   Modem,
   NetworkWireless,
   AudioCard,
   AudioInputMicrophone,
   CameraVideo,
   VideoDisplay,
   InputGaming,
   InputKeyboard,
   InputMouse,
   InputTablet,
   CameraPhoto,
   Scanner,
   Printer,
}

impl DeviceType {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   pub fn icon(self) -> &'static str {
      match self {
         Self::Computer => "laptop",
         Self::Pda | Self::Phone => "phone",
         Self::AudioCard => "speaker",
         Self::AudioInputMicrophone => "mic",
         Self::CameraVideo => "recorder",
         Self::VideoDisplay => "tv",
         Self::InputGaming => "game",
         Self::InputKeyboard => "keyboard",
         Self::InputMouse => "mouse",
         Self::Modem
         | Self::NetworkWireless
         | Self::InputTablet
         | Self::CameraPhoto
         | Self::Scanner
         | Self::Printer => FALLBACK_ICON,
      }
   }
}

/// How a major device class resolves.
enum MajorClass {
   /// Resolved through the minor class.
   Minor(fn(u8) -> Option<DeviceType>),
   /// Same type for every minor class.
   Direct(DeviceType),
}

fn major_class(major: u8) -> Option<MajorClass> {
   match major {
      1 => Some(MajorClass::Minor(computer_minor)),
      2 => Some(MajorClass::Minor(phone_minor)),
      3 => Some(MajorClass::Direct(DeviceType::NetworkWireless)),
      4 => Some(MajorClass::Minor(audio_video_minor)),
      5 => Some(MajorClass::Minor(peripheral_minor)),
      6 => Some(MajorClass::Minor(imaging_minor)),
      _ => None,
   }
}

// Reserved minor values fall back to the class default where one exists.

fn computer_minor(minor: u8) -> Option<DeviceType> {
   match minor {
      4 | 5 => Some(DeviceType::Pda),
      _ => Some(DeviceType::Computer),
   }
}

fn phone_minor(minor: u8) -> Option<DeviceType> {
   match minor {
      4 => Some(DeviceType::Modem),
      _ => Some(DeviceType::Phone),
   }
}

fn audio_video_minor(minor: u8) -> Option<DeviceType> {
   match minor {
      4 => Some(DeviceType::AudioInputMicrophone),
      11..=13 => Some(DeviceType::CameraVideo),
      14..=16 => Some(DeviceType::VideoDisplay),
      _ => Some(DeviceType::AudioCard),
   }
}

fn peripheral_minor(minor: u8) -> Option<DeviceType> {
   match minor {
      1 | 2 => Some(DeviceType::InputGaming),
      16..=31 => Some(DeviceType::InputKeyboard),
      37 => Some(DeviceType::InputTablet),
      32..=47 => Some(DeviceType::InputMouse),
      _ => None,
   }
}

fn imaging_minor(minor: u8) -> Option<DeviceType> {
   match minor {
      4 => Some(DeviceType::VideoDisplay),
      8 => Some(DeviceType::CameraPhoto),
      16 => Some(DeviceType::Scanner),
      32 => Some(DeviceType::Printer),
      _ => None,
   }
}

impl ClassOfDevice {
   pub const fn new(major_service_class: u16, major_device_class: u8, minor_device_class: u8) -> Self {
      Self {
         major_service_class,
         major_device_class,
         minor_device_class,
      }
   }

   /// Decodes the 24-bit class-of-device field.
   pub const fn from_raw(cod: u32) -> Self {
      Self {
         major_service_class: ((cod >> 13) & 0x7ff) as u16,
         major_device_class: ((cod >> 8) & 0x1f) as u8,
         minor_device_class: ((cod >> 2) & 0x3f) as u8,
      }
   }

   /// Classifies the device, `None` meaning "no known type".
   ///
   /// Major classes outside the table (wearable, toy, health, ...) are
   /// treated as audio devices when they advertise the Audio service, as
   /// hands-free units are required to.
   pub fn device_type(&self) -> Option<DeviceType> {
      match major_class(self.major_device_class) {
         Some(MajorClass::Minor(resolve)) => resolve(self.minor_device_class),
         Some(MajorClass::Direct(ty)) => Some(ty),
         None if self.major_service_class & SERVICE_CLASS_AUDIO != 0 => Some(DeviceType::AudioCard),
         None => None,
      }
   }

   /// Device type name, empty when unknown.
   pub fn device_type_str(&self) -> &'static str {
      self.device_type().map_or("", DeviceType::to_str)
   }

   /// Icon name, never empty.
   pub fn icon(&self) -> &'static str {
      self.device_type().map_or(FALLBACK_ICON, DeviceType::icon)
   }
}
