//! BlueZ setup over D-Bus: adapter identity and the HID SDP record that
//! makes the console see a gamepad.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use zbus::names::InterfaceName;
use zbus::zvariant::{ObjectPath, Value};
use zbus::Connection;

const ADAPTER_PATH: &str = "/org/bluez/hci0";
const PROFILE_PATH: &str = "/org/bluez/procon_mitm";
const HID_UUID: &str = "00001124-0000-1000-8000-00805f9b34fb";
/// Peripheral, gamepad.
const DEVICE_CLASS: &str = "0x002508";

/// HID report descriptor of a Pro Controller, hex encoded.
const HID_DESCRIPTOR: &str = "05010905a1010601ff852109217508953081028530093075089530810285310931750896690181028532093275089669018102853309337508966901810285340934750896690181028535093575089530810285390939750895308102853a093a7508953081020501093009310933093426ff00463fff00750895048102750895018101c0";

/// HID service record: PSM 17 control, PSM 19 interrupt.
fn service_record() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" ?>
<record>
  <attribute id="0x0001"><sequence><uuid value="0x1124"/></sequence></attribute>
  <attribute id="0x0004"><sequence>
    <sequence><uuid value="0x0100"/><uint16 value="0x0011"/></sequence>
    <sequence><uuid value="0x0011"/></sequence>
  </sequence></attribute>
  <attribute id="0x0005"><sequence><uuid value="0x1002"/></sequence></attribute>
  <attribute id="0x0006"><sequence>
    <uint16 value="0x656E"/><uint16 value="0x006A"/><uint16 value="0x0100"/>
  </sequence></attribute>
  <attribute id="0x0009"><sequence>
    <sequence><uuid value="0x1124"/><uint16 value="0x0100"/></sequence>
  </sequence></attribute>
  <attribute id="0x000D"><sequence><sequence>
    <sequence><uuid value="0x0100"/><uint16 value="0x0013"/></sequence>
    <sequence><uuid value="0x0011"/></sequence>
  </sequence></sequence></attribute>
  <attribute id="0x0100"><text value="Wireless Gamepad"/></attribute>
  <attribute id="0x0101"><text value="Gamepad"/></attribute>
  <attribute id="0x0102"><text value="Nintendo"/></attribute>
  <attribute id="0x0200"><uint16 value="0x0100"/></attribute>
  <attribute id="0x0201"><uint16 value="0x0111"/></attribute>
  <attribute id="0x0202"><uint8 value="0x08"/></attribute>
  <attribute id="0x0203"><uint8 value="0x00"/></attribute>
  <attribute id="0x0204"><boolean value="true"/></attribute>
  <attribute id="0x0205"><boolean value="true"/></attribute>
  <attribute id="0x0206"><sequence><sequence>
    <uint8 value="0x22"/><text encoding="hex" value="{HID_DESCRIPTOR}"/>
  </sequence></sequence></attribute>
  <attribute id="0x0207"><sequence>
    <sequence><uint16 value="0x0409"/><uint16 value="0x0100"/></sequence>
  </sequence></attribute>
  <attribute id="0x020B"><uint16 value="0x0100"/></attribute>
  <attribute id="0x020C"><uint16 value="0x0C80"/></attribute>
  <attribute id="0x020D"><boolean value="true"/></attribute>
  <attribute id="0x020E"><boolean value="true"/></attribute>
</record>"#
    )
}

/// Power the adapter and make it a discoverable, pairable "Pro Controller".
pub async fn configure_adapter(connection: &Connection) -> anyhow::Result<()> {
    info!("[BT] Configuring Bluetooth adapter...");

    let proxy = zbus::fdo::PropertiesProxy::builder(connection)
        .destination("org.bluez")?
        .path(ADAPTER_PATH)?
        .build()
        .await?;
    let adapter = InterfaceName::from_static_str_unchecked("org.bluez.Adapter1");

    let properties: [(&str, Value<'_>); 6] = [
        ("Powered", Value::from(true)),
        ("Alias", Value::from("Pro Controller")),
        ("Discoverable", Value::from(true)),
        ("Pairable", Value::from(true)),
        // 0 = forever
        ("DiscoverableTimeout", Value::from(0u32)),
        ("PairableTimeout", Value::from(0u32)),
    ];
    for (name, value) in &properties {
        proxy.set(adapter.clone(), name, value).await?;
        debug!("[BT] Adapter {name} = {value:?}");
    }

    // BlueZ does not expose the device class over D-Bus
    match tokio::process::Command::new("hciconfig")
        .args(["hci0", "class", DEVICE_CLASS])
        .output()
        .await
    {
        Ok(out) if out.status.success() => {}
        Ok(out) => warn!("[BT] hciconfig class failed: {}", String::from_utf8_lossy(&out.stderr).trim()),
        Err(e) => warn!("[BT] hciconfig unavailable: {e}"),
    }

    info!("[BT] Adapter configured: discoverable, pairable, class {DEVICE_CLASS}");
    Ok(())
}

/// Register the HID profile. An existing registration from a previous run is
/// fine.
pub async fn register_sdp_profile(connection: &Connection) -> anyhow::Result<()> {
    info!("[BT] Registering HID SDP profile...");

    let proxy = zbus::Proxy::new(connection, "org.bluez", "/org/bluez", "org.bluez.ProfileManager1").await?;

    let record = service_record();
    let options: HashMap<&str, Value<'_>> = HashMap::from([
        ("Role", Value::from("server")),
        ("RequireAuthentication", Value::from(false)),
        ("RequireAuthorization", Value::from(false)),
        ("AutoConnect", Value::from(true)),
        ("ServiceRecord", Value::from(record.as_str())),
    ]);
    let path = ObjectPath::from_static_str_unchecked(PROFILE_PATH);

    let result: Result<(), zbus::Error> = proxy.call("RegisterProfile", &(path, HID_UUID, options)).await;
    match result {
        Ok(()) => info!("[BT] SDP profile registered"),
        Err(e) if e.to_string().contains("AlreadyExists") || e.to_string().contains("Already Exists") => {
            warn!("[BT] SDP profile already registered (OK on restart)");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
