//! Embedded presentation layer: the browser upload page.
//!
//! Served as a single static page; all state it shows comes from polling
//! `/api/status`, so it holds none of its own.

pub const UPLOAD_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Firmware Update</title>
<style>
body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #0f172a; color: #f8fafc; display: flex; justify-content: center; padding: 40px 16px; }
.card { background: #1e293b; border: 1px solid #334155; border-radius: 12px; padding: 28px; max-width: 460px; width: 100%; }
h1 { font-size: 22px; margin: 0 0 4px; }
p.sub { color: #94a3b8; margin: 0 0 20px; }
button { background: #3b82f6; color: #fff; border: none; border-radius: 8px; padding: 10px 20px; font-size: 15px; cursor: pointer; }
button:disabled { background: #475569; cursor: default; }
progress { width: 100%; height: 10px; margin: 16px 0 6px; }
#status { margin-top: 14px; padding: 10px; border-radius: 8px; display: none; }
#status.ok { display: block; background: #064e3b; color: #6ee7b7; }
#status.err { display: block; background: #7f1d1d; color: #fca5a5; }
#conn { color: #94a3b8; font-size: 13px; margin-top: 18px; }
</style>
</head>
<body>
<div class="card">
<h1>Firmware Update</h1>
<p class="sub">Upload a new firmware image (.bin)</p>
<input type="file" id="file" accept=".bin">
<button id="upload" onclick="upload()">Upload</button>
<progress id="bar" value="0" max="100" hidden></progress>
<div id="status"></div>
<div id="conn"></div>
</div>
<script>
function show(msg, cls) {
  const s = document.getElementById('status');
  s.textContent = msg;
  s.className = cls;
}
function upload() {
  const file = document.getElementById('file').files[0];
  if (!file) { show('Select a firmware file first', 'err'); return; }
  const form = new FormData();
  form.append('firmware', file);
  const xhr = new XMLHttpRequest();
  const bar = document.getElementById('bar');
  bar.hidden = false;
  document.getElementById('upload').disabled = true;
  xhr.upload.addEventListener('progress', e => {
    if (e.lengthComputable) bar.value = Math.round(e.loaded / e.total * 100);
  });
  xhr.addEventListener('load', () => {
    document.getElementById('upload').disabled = false;
    if (xhr.status === 200) show('Update successful. Device is restarting…', 'ok');
    else show('Update failed: ' + xhr.responseText, 'err');
  });
  xhr.addEventListener('error', () => {
    document.getElementById('upload').disabled = false;
    show('Upload failed: network error', 'err');
  });
  xhr.open('POST', '/update');
  xhr.setRequestHeader('X-Firmware-Size', file.size);
  xhr.send(form);
}
async function poll() {
  try {
    const r = await fetch('/api/status');
    const s = await r.json();
    const c = s.connectivity;
    document.getElementById('conn').textContent =
      'mode: ' + c.mode + ' · link: ' + c.link + (c.ip_address ? ' · ip: ' + c.ip_address : '');
  } catch (e) { /* device may be rebooting */ }
}
poll();
setInterval(poll, 3000);
</script>
</body>
</html>
"#;
