use axum::response::{Html, IntoResponse, Response};

/// Serve the interactive development console.
///
/// A single self-contained HTML file: it connects a WebSocket back to the
/// URL it was loaded from, so visiting http://[host]/foo in a browser
/// exercises ws://[host]/foo.
pub(crate) fn serve() -> Response {
    Html(CONSOLE_CONTENT).into_response()
}

// All CSS and JS inline; the console gets by without any framework.
const CONSOLE_CONTENT: &str = r#"<!DOCTYPE html>
<meta charset="utf8">
<title>websocketd console</title>
<style>
  body, input {
    font-family: dejavu sans mono, Menlo, Monaco, Consolas, Lucida Console, tahoma, arial;
    font-size: 13px;
  }
  body { margin: 0; }
  .header {
    background-color: #efefef;
    padding: 4px;
    position: absolute;
    top: 0; left: 0; right: 0;
    height: 28px;
  }
  .header .url { width: 60%; }
  .messages {
    position: absolute;
    top: 36px; bottom: 36px; left: 0; right: 0;
    overflow-y: scroll;
    margin: 0;
    padding: 4px;
    list-style: none;
  }
  .messages li { white-space: pre-wrap; }
  .messages .sent { color: #00f; }
  .messages .received { color: #000; }
  .messages .meta { color: #888; font-style: italic; }
  .footer {
    background-color: #efefef;
    padding: 4px;
    position: absolute;
    bottom: 0; left: 0; right: 0;
    height: 28px;
  }
  .footer .send-input { width: 80%; }
</style>

<div class="header">
  <input class="url" type="text">
  <button class="connect">Connect</button>
  <button class="disconnect" disabled>Disconnect</button>
</div>
<ul class="messages"></ul>
<div class="footer">
  <input class="send-input" type="text" disabled placeholder="Message to send">
  <button class="send" disabled>Send</button>
</div>

<script>
  var ws = null;

  function select(selector) {
    return document.querySelector(selector);
  }

  function appendMessage(cls, text) {
    var item = document.createElement('li');
    item.className = cls;
    item.textContent = text;
    var list = select('.messages');
    list.appendChild(item);
    list.scrollTop = list.scrollHeight;
  }

  function setConnected(connected) {
    select('.connect').disabled = connected;
    select('.disconnect').disabled = !connected;
    select('.send-input').disabled = !connected;
    select('.send').disabled = !connected;
  }

  function connect() {
    var url = select('.url').value;
    ws = new WebSocket(url);
    appendMessage('meta', 'Connecting to ' + url + '...');
    ws.onopen = function() {
      appendMessage('meta', 'Connected.');
      setConnected(true);
      select('.send-input').focus();
    };
    ws.onclose = function() {
      appendMessage('meta', 'Disconnected.');
      setConnected(false);
      ws = null;
    };
    ws.onerror = function() {
      appendMessage('meta', 'Connection error.');
    };
    ws.onmessage = function(event) {
      appendMessage('received', event.data);
    };
  }

  function disconnect() {
    if (ws) {
      ws.close();
    }
  }

  function send() {
    var input = select('.send-input');
    if (ws && input.value !== '') {
      ws.send(input.value);
      appendMessage('sent', input.value);
      input.value = '';
    }
  }

  function ready() {
    var scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
    select('.url').value = scheme + location.host + location.pathname;

    select('.connect').addEventListener('click', connect);
    select('.disconnect').addEventListener('click', disconnect);
    select('.send').addEventListener('click', send);
    select('.send-input').addEventListener('keydown', function(event) {
      if (event.key === 'Enter') {
        send();
      }
    });
  }

  document.addEventListener('DOMContentLoaded', ready, false);
</script>
"#;
